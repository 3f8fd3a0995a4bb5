// src/job/run.rs

//! One run of a job: its action runs plus the logic that walks them through
//! the action graph.
//!
//! A `JobRun` never calls back into its scheduler. Anything the scheduler
//! must react to is buffered as a [`JobRunNotification`] and drained with
//! [`JobRun::take_notifications`] after each mutation.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::{ActionGraph, StringBufferStore};
use crate::actionrun::collection::Aggregate;
use crate::actionrun::{ActionRun, ActionRunCollection, ActionRunState, ActionRunStateData};
use crate::command_context::{CommandContext, JobRunContext};
use crate::engine::ActionRunOp;
use crate::engine::env::EngineEnv;
use crate::errors::{Result, TronError};
use crate::node::{CommandLifecycle, Node};

/// Value of `cleanup_job_status` while the run has not failed or completed.
pub const CLEANUP_STATUS_UNKNOWN: &str = "UNKNOWN";
pub const CLEANUP_STATUS_SUCCESS: &str = "SUCCESS";
pub const CLEANUP_STATUS_FAILURE: &str = "FAILURE";

/// Things that happened to a job run that its scheduler cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRunNotification {
    /// Some action run changed state; persist the run.
    StateChanged,
    Started,
    /// `start` found startable actions but none of them got going.
    StartFailed,
    /// Every action (and the cleanup action) is done.
    Done,
}

enum Reply {
    Applied(bool, &'static str),
    Message(String),
}

/// Persisted form of a [`JobRun`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunStateData {
    pub job_name: String,
    pub run_num: u64,
    pub run_time: DateTime<Utc>,
    #[serde(default)]
    pub node_name: Option<String>,
    pub runs: Vec<ActionRunStateData>,
    #[serde(default)]
    pub cleanup_run: Option<ActionRunStateData>,
    #[serde(default)]
    pub manual: bool,
}

#[derive(Debug)]
pub struct JobRun {
    pub job_name: String,
    pub run_num: u64,
    /// Logical time the run was scheduled for.
    pub run_time: DateTime<Utc>,
    pub manual: bool,
    node: Option<Arc<Node>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    action_runs: ActionRunCollection,
    job_context: CommandContext,
    /// Finished action output lands in `<output_dir>/<action>.{stdout,stderr}`.
    output_dir: Option<PathBuf>,
    pending: Vec<JobRunNotification>,
}

impl JobRun {
    /// A fresh run with one SCHEDULED action run per action.
    ///
    /// An action with its own `node` runs on the next node of that pool;
    /// the rest run on the job run's node.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        job_name: &str,
        run_num: u64,
        run_time: DateTime<Utc>,
        node: Option<Arc<Node>>,
        manual: bool,
        graph: Arc<ActionGraph>,
        job_context: CommandContext,
        env: &EngineEnv,
    ) -> Self {
        let actions = graph.actions().chain(graph.cleanup());
        let runs = actions
            .map(|action| {
                let action_node = action
                    .node
                    .as_deref()
                    .and_then(|name| env.node_pools.get_pool(name))
                    .and_then(|pool| pool.next())
                    .or_else(|| node.clone());
                ActionRun::build(
                    job_name,
                    run_num,
                    action,
                    action_node,
                    env.action_runner.clone(),
                )
            })
            .collect();

        debug!(job = job_name, run_num, %run_time, manual, "built job run");
        Self {
            job_name: job_name.to_string(),
            run_num,
            run_time,
            manual,
            node,
            start_time: None,
            end_time: None,
            action_runs: ActionRunCollection::new(graph, runs),
            job_context,
            output_dir: None,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}.{}", self.job_name, self.run_num)
    }

    pub fn with_output_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.output_dir = dir;
        self
    }

    pub fn output_dir(&self) -> Option<&PathBuf> {
        self.output_dir.as_ref()
    }

    pub fn node(&self) -> Option<&Arc<Node>> {
        self.node.as_ref()
    }

    pub fn action_runs(&self) -> &ActionRunCollection {
        &self.action_runs
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time.or_else(|| self.action_runs.start_time())
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn take_notifications(&mut self) -> Vec<JobRunNotification> {
        std::mem::take(&mut self.pending)
    }

    /// Derived from the action runs, first match wins.
    pub fn state(&self) -> ActionRunState {
        let runs = &self.action_runs;
        if runs.is_complete() {
            return ActionRunState::Succeeded;
        }
        if runs.aggregate(Aggregate::Cancelled) {
            return ActionRunState::Cancelled;
        }
        if runs.aggregate(Aggregate::Running) {
            return ActionRunState::Running;
        }
        if runs.aggregate(Aggregate::Starting) {
            return ActionRunState::Starting;
        }
        if runs.is_failed() {
            return ActionRunState::Failed;
        }
        if runs.aggregate(Aggregate::Scheduled) {
            return ActionRunState::Scheduled;
        }
        if runs.aggregate(Aggregate::Queued) {
            return ActionRunState::Queued;
        }
        // An action whose outcome is unknown makes the run unknown. Anything
        // else reaching here is a hole in the precedence above.
        let unknown_action = runs
            .action_runs_with_cleanup()
            .any(|run| run.state() == ActionRunState::Unknown);
        if !unknown_action {
            warn!(job_run = %self.id(), runs = %runs.describe(), "job run in an unexpected state");
        }
        ActionRunState::Unknown
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Scheduled or queued: waiting for the scheduler.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.state(),
            ActionRunState::Scheduled | ActionRunState::Queued
        )
    }

    pub fn is_done(&self) -> bool {
        self.state().is_end()
    }

    fn cleanup_job_status(&self) -> &'static str {
        if self.action_runs.is_failed() {
            CLEANUP_STATUS_FAILURE
        } else if self.action_runs.is_complete_without_cleanup() {
            CLEANUP_STATUS_SUCCESS
        } else {
            CLEANUP_STATUS_UNKNOWN
        }
    }

    /// Context for rendering this run's commands.
    pub fn context(&self, env: &EngineEnv) -> CommandContext {
        CommandContext::chained(
            JobRunContext {
                run_id: self.id(),
                run_time: self.run_time.with_timezone(&env.time_zone),
                manual: self.manual,
                cleanup_job_status: self.cleanup_job_status().to_string(),
            },
            &self.job_context,
        )
    }

    /// Start every startable action. Returns false if nothing could start.
    pub fn start(&mut self, env: &EngineEnv) -> bool {
        if !self.action_runs.has_startable() {
            info!(job_run = %self.id(), "job run has no startable actions");
            return false;
        }

        info!(job_run = %self.id(), "starting job run");
        self.start_time = Some(env.now());
        for run in self.action_runs.action_runs_with_cleanup_mut() {
            run.ready();
        }
        self.pending.push(JobRunNotification::StateChanged);

        if self.start_action_runs(env) > 0 {
            self.pending.push(JobRunNotification::Started);
            true
        } else {
            warn!(job_run = %self.id(), "no action runs started");
            self.pending.push(JobRunNotification::StartFailed);
            self.progress(false, env);
            false
        }
    }

    /// Start unblocked actions until no more become startable. Returns how
    /// many are active afterwards.
    fn start_action_runs(&mut self, env: &EngineEnv) -> usize {
        let context = self.context(env);
        let mut started = Vec::new();
        loop {
            let names = self.action_runs.startable_names();
            if names.is_empty() {
                break;
            }
            for name in names {
                let Some(run) = self.action_runs.get_mut(&name) else {
                    continue;
                };
                let before = run.state();
                run.start(&context, env);
                if run.state() != before {
                    self.pending.push(JobRunNotification::StateChanged);
                }
                started.push(name);
            }
        }
        started
            .iter()
            .filter_map(|name| self.action_runs.get(name))
            .filter(|run| run.state().is_active())
            .count()
    }

    /// Run `f` against one action run and react to its state change.
    ///
    /// Every mutation of an action run from outside the job run goes
    /// through here so that dependents start and the run finalizes.
    pub fn with_action_run<R>(
        &mut self,
        action: &str,
        env: &EngineEnv,
        f: impl FnOnce(&mut ActionRun, &CommandContext, &EngineEnv) -> R,
    ) -> Option<R> {
        let context = self.context(env);
        let run = self.action_runs.get_mut(action)?;
        let before = run.state();
        let result = f(run, &context, env);
        let after = run.state();
        self.action_run_changed(action, before, after, env);
        Some(result)
    }

    fn action_run_changed(
        &mut self,
        action: &str,
        before: ActionRunState,
        after: ActionRunState,
        env: &EngineEnv,
    ) {
        if before == after {
            return;
        }
        debug!(job_run = %self.id(), action, from = %before, to = %after, "action run changed state");
        self.pending.push(JobRunNotification::StateChanged);
        if after.is_end() {
            self.write_output(action, env);
            self.progress(!after.is_broken(), env);
        }
    }

    fn write_output(&self, action: &str, env: &EngineEnv) {
        let Some(dir) = &self.output_dir else {
            return;
        };
        let Some(output) = self.action_runs.get(action).and_then(ActionRun::output) else {
            return;
        };
        for stream in [StringBufferStore::STDOUT, StringBufferStore::STDERR] {
            let mut contents = String::new();
            for line in output.lines(stream) {
                contents.push_str(line);
                contents.push('\n');
            }
            let path = dir.join(format!("{action}.{stream}"));
            if let Err(err) = env.fs.write_atomic(&path, contents.as_bytes()) {
                warn!(job_run = %self.id(), action, path = %path.display(), error = %err, "failed to write action output");
            }
        }
    }

    /// Called after an action run ended: start what became unblocked, then
    /// cleanup once everything else is done, then finalize.
    fn progress(&mut self, try_start: bool, env: &EngineEnv) {
        if try_start && self.start_action_runs(env) > 0 {
            return;
        }
        if !self.action_runs.is_done() {
            return;
        }

        let context = self.context(env);
        let id = self.id();
        if let Some(cleanup) = self.action_runs.cleanup_action_run_mut() {
            if !cleanup.is_done() {
                if !cleanup.check("start") {
                    // Cleanup is already running.
                    return;
                }
                info!(job_run = %id, "starting cleanup action");
                let before = cleanup.state();
                cleanup.start(&context, env);
                let after = cleanup.state();
                if after != before {
                    self.pending.push(JobRunNotification::StateChanged);
                }
                if !after.is_end() {
                    return;
                }
            }
        }
        self.finalize(env);
    }

    fn finalize(&mut self, env: &EngineEnv) {
        self.end_time = Some(env.now());
        let state = self.state();
        if self.action_runs.is_failed() {
            warn!(job_run = %self.id(), %state, "job run failed");
        } else {
            info!(job_run = %self.id(), %state, "job run finished");
        }
        self.pending.push(JobRunNotification::StateChanged);
        self.pending.push(JobRunNotification::Done);
    }

    /// Feed a command lifecycle callback to the named action run.
    pub fn handle_command(
        &mut self,
        action: &str,
        key: &str,
        lifecycle: &CommandLifecycle,
        env: &EngineEnv,
    ) -> bool {
        self.with_action_run(action, env, |run, context, env| {
            run.handle_command(key, lifecycle, context, env)
        })
        .unwrap_or(false)
    }

    /// Apply the same transition to every action run, then react once.
    fn for_all(&mut self, env: &EngineEnv, mut f: impl FnMut(&mut ActionRun) -> bool) -> bool {
        let mut any = false;
        for run in self.action_runs.action_runs_with_cleanup_mut() {
            any |= f(run);
        }
        if any {
            self.pending.push(JobRunNotification::StateChanged);
            if self.action_runs.is_done() && self.end_time.is_none() {
                self.progress(false, env);
            }
        }
        any
    }

    pub fn cancel(&mut self, env: &EngineEnv) -> bool {
        let now = env.now();
        self.for_all(env, |run| run.cancel(now))
    }

    pub fn success(&mut self, env: &EngineEnv) -> bool {
        let now = env.now();
        self.for_all(env, |run| run.success(now))
    }

    pub fn fail(&mut self, env: &EngineEnv) -> bool {
        let now = env.now();
        self.for_all(env, |run| run.fail(Some(1), now))
    }

    /// Hold every action until an overlapping run finishes.
    pub fn queue(&mut self, env: &EngineEnv) -> bool {
        self.for_all(env, ActionRun::queue)
    }

    /// Ask every active action run to terminate.
    pub fn stop(&mut self, env: &EngineEnv) -> Vec<String> {
        let mut messages = Vec::new();
        let active: Vec<String> = self
            .action_runs
            .action_runs_with_cleanup()
            .filter(|run| run.state().is_active())
            .map(|run| run.action_name().to_string())
            .collect();
        for name in active {
            if let Some(message) =
                self.with_action_run(&name, env, |run, context, env| run.stop(context, env))
            {
                messages.push(message);
            }
        }
        messages
    }

    /// Operator command against one action run.
    pub fn action_op(&mut self, action: &str, op: ActionRunOp, env: &EngineEnv) -> Result<String> {
        if self.action_runs.get(action).is_none() {
            return Err(TronError::ActionRunNotFound(format!("{}.{action}", self.id())));
        }
        if op == ActionRunOp::Start {
            // A manual start skips the dependency check, but not on cleanup.
            let is_cleanup = self
                .action_runs
                .get(action)
                .is_some_and(ActionRun::is_cleanup);
            if is_cleanup {
                return Ok(format!("Cannot start cleanup action {}.{action}", self.id()));
            }
            if self.start_time.is_none() {
                self.start_time = Some(env.now());
            }
        }

        let id = format!("{}.{action}", self.id());
        let reply = self.with_action_run(action, env, |run, context, env| {
            let now = env.now();
            match op {
                ActionRunOp::Start => Reply::Applied(run.start(context, env), "start"),
                ActionRunOp::Success => Reply::Applied(run.success(now), "succeed"),
                ActionRunOp::Fail(status) => {
                    Reply::Applied(run.fail(Some(status.unwrap_or(1)), now), "fail")
                }
                ActionRunOp::Skip => Reply::Applied(run.skip(now), "skip"),
                ActionRunOp::Cancel => Reply::Applied(run.cancel(now), "cancel"),
                ActionRunOp::Stop => Reply::Message(run.stop(context, env)),
                ActionRunOp::Kill => Reply::Message(run.kill(true, context, env)),
                ActionRunOp::Retry => Reply::Message(run.retry(context, env)),
                ActionRunOp::Recover => Reply::Applied(run.recover(env), "recover"),
            }
        });
        let state = self
            .action_runs
            .get(action)
            .map(ActionRun::state)
            .unwrap_or(ActionRunState::Unknown);
        Ok(match reply {
            Some(Reply::Applied(true, _)) => format!("{id} now in state {state}"),
            Some(Reply::Applied(false, verb)) => {
                format!("Failed to {verb} {id}, currently {state}")
            }
            Some(Reply::Message(message)) => message,
            None => String::new(),
        })
    }

    /// Snapshot for persistence.
    pub fn state_data(&self) -> JobRunStateData {
        JobRunStateData {
            job_name: self.job_name.clone(),
            run_num: self.run_num,
            run_time: self.run_time,
            node_name: self.node.as_ref().map(|n| n.name.clone()),
            runs: self.action_runs.state_data(),
            cleanup_run: self.action_runs.cleanup_state_data(),
            manual: self.manual,
        }
    }

    /// Rebuild a run from persisted state. Action runs whose action is no
    /// longer in the graph are dropped.
    pub fn from_state(
        data: &JobRunStateData,
        graph: Arc<ActionGraph>,
        job_context: CommandContext,
        env: &EngineEnv,
    ) -> Self {
        let now = env.now();
        let node = data
            .node_name
            .as_deref()
            .and_then(|name| env.node_pools.find_node(name));

        let restore = |action_data: &ActionRunStateData, is_cleanup: bool| {
            let action_node = action_data
                .node_name
                .as_deref()
                .and_then(|name| env.node_pools.find_node(name))
                .or_else(|| node.clone());
            ActionRun::from_state(
                action_data,
                &data.job_name,
                data.run_num,
                action_node,
                is_cleanup,
                now,
            )
        };

        let mut runs = Vec::new();
        for action_data in &data.runs {
            let known = graph
                .get(&action_data.action_name)
                .is_some_and(|action| !action.is_cleanup());
            if !known {
                warn!(
                    job = %data.job_name,
                    run_num = data.run_num,
                    action = %action_data.action_name,
                    "dropping restored action run with no matching action"
                );
                continue;
            }
            runs.push(restore(action_data, false));
        }
        if let Some(cleanup) = &data.cleanup_run {
            if graph.cleanup().is_some() {
                runs.push(restore(cleanup, true));
            }
        }

        let action_runs = ActionRunCollection::new(graph, runs);
        let start_time = action_runs.start_time();
        let end_time = action_runs.end_time();
        Self {
            job_name: data.job_name.clone(),
            run_num: data.run_num,
            run_time: data.run_time,
            manual: data.manual,
            node,
            start_time,
            end_time,
            action_runs,
            job_context,
            output_dir: None,
            pending: Vec::new(),
        }
    }
}
