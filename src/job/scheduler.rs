// src/job/scheduler.rs

//! Timing and overlap control for one job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::actionrun::ActionRunState;
use crate::engine::env::EngineEnv;
use crate::engine::{ActionRunOp, EngineEvent, JobRunOp};
use crate::errors::{Result, TronError};
use crate::eventloop::TimerEvent;
use crate::job::run::{JobRun, JobRunNotification, JobRunStateData};
use crate::job::{Job, JobStateData, JobStatus};
use crate::node::{CommandLifecycle, Node};
use crate::recovery::launch_recovery_actionruns_for_job_runs;

/// Drives a [`Job`]: builds runs from its scheduling policy, starts them
/// when their timer fires and reacts when they finish.
#[derive(Debug)]
pub struct JobScheduler {
    job: Job,
}

impl JobScheduler {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn status(&self) -> JobStatus {
        self.job.status()
    }

    pub fn state_data(&self) -> JobStateData {
        self.job.state_data()
    }

    fn job_changed(&self, env: &EngineEnv) {
        env.notify(EngineEvent::JobChanged {
            job: self.job.name.clone(),
        });
    }

    fn run_changed(&self, run_num: u64, env: &EngineEnv) {
        env.notify(EngineEvent::JobRunChanged {
            job: self.job.name.clone(),
            run_num,
        });
    }

    fn run_job_event(&self, run_num: u64, run_queued: bool) -> TimerEvent {
        TimerEvent::RunJob {
            job: self.job.name.clone(),
            run_num,
            run_queued,
        }
    }

    fn seconds_until(run_time: DateTime<Utc>, env: &EngineEnv) -> Duration {
        (run_time - env.now()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn enable(&mut self, env: &EngineEnv) {
        if self.job.enabled {
            return;
        }
        info!(job = %self.job.name, "enabling job");
        self.job.enabled = true;
        self.job_changed(env);
        self.create_and_schedule_runs(true, env);
    }

    /// Disable the job and cancel every run that has not started.
    pub fn disable(&mut self, env: &EngineEnv) {
        info!(job = %self.job.name, "disabling job");
        self.job.enabled = false;
        self.job_changed(env);
        let pending: Vec<u64> = self.job.runs.get_pending().map(|r| r.run_num).collect();
        for run_num in pending {
            if let Some(run) = self.job.runs.get_mut(run_num) {
                run.cancel(env);
            }
            self.process_notifications(run_num, env);
        }
    }

    pub fn schedule(&mut self, env: &EngineEnv) {
        self.create_and_schedule_runs(false, env);
    }

    /// Build the next run(s) and arm their timers. Does nothing while the
    /// job is disabled or a run is already waiting.
    pub fn create_and_schedule_runs(&mut self, ignore_last_run_time: bool, env: &EngineEnv) -> Vec<u64> {
        if !self.job.enabled || self.job.runs.has_pending() {
            return Vec::new();
        }
        let last_run_time = if ignore_last_run_time {
            None
        } else {
            self.job.runs.get_newest(false).map(|run| run.run_time)
        };
        let run_time = self.job.scheduler.next_run_time(last_run_time, env.now());
        let run_nums = self.build_new_runs(run_time, false, env);

        let delay = Self::seconds_until(run_time, env);
        for &run_num in &run_nums {
            debug!(job = %self.job.name, run_num, delay_secs = delay.as_secs(), "scheduling job run");
            env.event_loop.call_later(delay, self.run_job_event(run_num, false));
        }
        run_nums
    }

    /// One run per node of the pool when `all_nodes`, otherwise one run on
    /// the pool's next node.
    fn build_new_runs(&mut self, run_time: DateTime<Utc>, manual: bool, env: &EngineEnv) -> Vec<u64> {
        let nodes: Vec<Option<Arc<Node>>> = if self.job.all_nodes {
            self.job.node_pool.nodes().iter().cloned().map(Some).collect()
        } else {
            vec![self.job.node_pool.next()]
        };

        let mut run_nums = Vec::new();
        for node in nodes {
            let run_num = self.job.runs.next_run_num();
            let run = JobRun::build(
                &self.job.name,
                run_num,
                run_time,
                node,
                manual,
                Arc::clone(&self.job.graph),
                self.job.context.clone(),
                env,
            )
            .with_output_dir(self.job.run_output_dir(run_num));
            self.job.runs.insert(run);
            self.run_changed(run_num, env);
            run_nums.push(run_num);
        }

        for removed in self.job.runs.remove_old_runs() {
            env.notify(EngineEvent::JobRunRemoved {
                job: self.job.name.clone(),
                run_num: removed.run_num,
            });
        }
        self.job_changed(env);
        run_nums
    }

    /// Build manual runs at `run_time` (default now) and start them.
    pub fn manual_start(&mut self, run_time: Option<DateTime<Utc>>, env: &EngineEnv) -> Vec<u64> {
        let run_time = run_time.unwrap_or_else(|| env.now());
        let run_nums = self.build_new_runs(run_time, true, env);
        for &run_num in &run_nums {
            info!(job = %self.job.name, run_num, "manually starting job run");
            self.start_run(run_num, env);
            self.process_notifications(run_num, env);
        }
        run_nums
    }

    fn start_run(&mut self, run_num: u64, env: &EngineEnv) -> bool {
        let Some(run) = self.job.runs.get_mut(run_num) else {
            return false;
        };
        let started = run.start(env);
        if started {
            if let Some(max_runtime) = self.job.max_runtime {
                env.event_loop.call_later(
                    max_runtime,
                    TimerEvent::StopJobRun {
                        job: self.job.name.clone(),
                        run_num,
                    },
                );
            }
        }
        started
    }

    /// The timer for a run fired (or a queued run was promoted).
    pub fn run_job(&mut self, run_num: u64, run_queued: bool, env: &EngineEnv) {
        if env.is_shutdown() {
            info!(job = %self.job.name, run_num, "shutdown requested, not starting job run");
            return;
        }
        let Some(run) = self.job.runs.get_mut(run_num) else {
            warn!(job = %self.job.name, run_num, "job run no longer exists");
            return;
        };

        if !self.job.enabled {
            info!(job_run = %run.id(), "job is disabled, cancelling run");
            run.cancel(env);
            self.process_notifications(run_num, env);
            return;
        }

        let state = run.state();
        if !run_queued && state != ActionRunState::Scheduled {
            info!(job_run = %run.id(), %state, "job run was already handled, rescheduling");
            self.schedule(env);
            return;
        }

        let node = if self.job.all_nodes {
            run.node().cloned()
        } else {
            None
        };
        let overlapping = !self.job.allow_overlap
            && self
                .job
                .runs
                .get_active(node.as_deref())
                .any(|active| active.run_num != run_num);
        if overlapping {
            if self.job.queueing {
                info!(job = %self.job.name, run_num, "another run is active, queueing");
                if let Some(run) = self.job.runs.get_mut(run_num) {
                    run.queue(env);
                }
                self.process_notifications(run_num, env);
            } else {
                warn!(job = %self.job.name, run_num, "another run is active, cancelling");
                if let Some(run) = self.job.runs.get_mut(run_num) {
                    run.cancel(env);
                }
                self.process_notifications(run_num, env);
                self.schedule(env);
            }
            return;
        }

        let started = self.start_run(run_num, env);
        self.process_notifications(run_num, env);
        if !self.job.scheduler.schedule_on_complete() || !started {
            self.schedule(env);
        }
    }

    /// `max_runtime` elapsed.
    pub fn stop_job_run(&mut self, run_num: u64, env: &EngineEnv) {
        let Some(run) = self.job.runs.get_mut(run_num) else {
            return;
        };
        if !run.is_active() {
            return;
        }
        warn!(job_run = %run.id(), "job run exceeded max runtime, stopping");
        for message in run.stop(env) {
            info!(job_run = %run.id(), message = %message, "stop requested");
        }
        self.process_notifications(run_num, env);
    }

    pub fn handle_command(
        &mut self,
        run_num: u64,
        action: &str,
        key: &str,
        lifecycle: &CommandLifecycle,
        env: &EngineEnv,
    ) -> bool {
        let Some(run) = self.job.runs.get_mut(run_num) else {
            debug!(job = %self.job.name, run_num, key, "command update for a removed job run");
            return false;
        };
        let handled = run.handle_command(action, key, lifecycle, env);
        self.process_notifications(run_num, env);
        handled
    }

    /// A delayed recovery probe is due.
    pub fn submit_recovery(&mut self, run_num: u64, action: &str, env: &EngineEnv) {
        let Some(run) = self.job.runs.get_mut(run_num) else {
            return;
        };
        let gave_up = run
            .with_action_run(action, env, |run, _, env| run.submit_recovery(env))
            .unwrap_or(false);
        if gave_up {
            info!(job = %self.job.name, run_num, action, "recovery could not be submitted, outcome unknown");
        }
        self.process_notifications(run_num, env);
    }

    pub fn action_op(
        &mut self,
        run_num: u64,
        action: &str,
        op: ActionRunOp,
        env: &EngineEnv,
    ) -> Result<String> {
        let key = self.job.run_key(run_num);
        let run = self
            .job
            .runs
            .get_mut(run_num)
            .ok_or(TronError::JobRunNotFound(key))?;
        let message = run.action_op(action, op, env);
        self.process_notifications(run_num, env);
        message
    }

    pub fn job_run_op(&mut self, run_num: u64, op: JobRunOp, env: &EngineEnv) -> Result<String> {
        let id = self.job.run_key(run_num);
        if self.job.runs.get(run_num).is_none() {
            return Err(TronError::JobRunNotFound(id));
        }

        let applied = match op {
            JobRunOp::Start => self.start_run(run_num, env),
            JobRunOp::Cancel => self.with_run(run_num, |run| run.cancel(env)),
            JobRunOp::Success => self.with_run(run_num, |run| run.success(env)),
            JobRunOp::Fail => self.with_run(run_num, |run| run.fail(env)),
            JobRunOp::Stop => self.with_run(run_num, |run| !run.stop(env).is_empty()),
        };
        self.process_notifications(run_num, env);

        let state = self
            .job
            .runs
            .get(run_num)
            .map_or(ActionRunState::Unknown, JobRun::state);
        Ok(if applied {
            format!("{id} now in state {state}")
        } else {
            format!("Failed to {} {id}, currently {state}", op.as_str())
        })
    }

    fn with_run(&mut self, run_num: u64, f: impl FnOnce(&mut JobRun) -> bool) -> bool {
        self.job.runs.get_mut(run_num).is_some_and(f)
    }

    /// Drain a run's notifications and react to them.
    fn process_notifications(&mut self, run_num: u64, env: &EngineEnv) {
        let Some(run) = self.job.runs.get_mut(run_num) else {
            return;
        };
        let node = run.node().cloned();
        let notifications = run.take_notifications();
        if notifications.is_empty() {
            return;
        }
        if notifications.contains(&JobRunNotification::StateChanged) {
            self.run_changed(run_num, env);
        }
        for notification in notifications {
            match notification {
                JobRunNotification::StateChanged => {}
                JobRunNotification::Started => {
                    debug!(job = %self.job.name, run_num, "job run started");
                }
                JobRunNotification::StartFailed => {
                    if self.job.scheduler.schedule_on_complete() {
                        self.schedule(env);
                    }
                }
                JobRunNotification::Done => self.run_done(node.as_deref(), env),
            }
        }
    }

    /// Promote the oldest queued run, then make sure a next run exists.
    fn run_done(&mut self, node: Option<&Node>, env: &EngineEnv) {
        let node = if self.job.all_nodes { node } else { None };
        if let Some(queued) = self.job.runs.get_first_queued(node) {
            info!(job_run = %queued.id(), "promoting queued job run");
            env.event_loop
                .call_later(Duration::ZERO, self.run_job_event(queued.run_num, true));
        }
        self.schedule(env);
    }

    /// Rebuild runs from persisted state, recover lost action runs and arm
    /// timers for runs that still have to happen.
    pub fn restore_state(
        &mut self,
        state: &JobStateData,
        runs: &HashMap<u64, JobRunStateData>,
        env: &EngineEnv,
    ) {
        self.job.enabled = state.enabled;
        for run_num in &state.run_nums {
            let Some(data) = runs.get(run_num) else {
                warn!(job = %self.job.name, run_num, "no stored state for job run");
                continue;
            };
            let run = JobRun::from_state(
                data,
                Arc::clone(&self.job.graph),
                self.job.context.clone(),
                env,
            )
            .with_output_dir(self.job.run_output_dir(*run_num));
            self.job.runs.insert(run);
        }
        info!(job = %self.job.name, runs = self.job.runs.len(), "restored job runs");

        let recovered = launch_recovery_actionruns_for_job_runs(
            self.job.runs.iter_mut(),
            &env.action_runner,
            env,
        );
        if recovered > 0 {
            info!(job = %self.job.name, recovered, "recovering action runs");
        }

        let scheduled: Vec<(u64, DateTime<Utc>)> = self
            .job
            .runs
            .get_runs_by_state(ActionRunState::Scheduled)
            .map(|run| (run.run_num, run.run_time))
            .collect();
        for (run_num, run_time) in scheduled {
            let delay = Self::seconds_until(run_time, env);
            env.event_loop.call_later(delay, self.run_job_event(run_num, false));
        }

        if let Some(queued) = self.job.runs.get_first_queued(None) {
            env.event_loop
                .call_later(Duration::ZERO, self.run_job_event(queued.run_num, true));
        }

        for run_num in self.job.runs.run_nums() {
            self.process_notifications(run_num, env);
        }
        self.schedule(env);
    }
}
