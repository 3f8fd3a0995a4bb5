// src/actionrun/mod.rs

//! One execution attempt of one action within a job run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::action::runner::StopSignal;
use crate::action::{Action, ActionRunner, StringBufferStore};
use crate::command_context::{ActionRunContext, CommandContext, render};
use crate::engine::env::EngineEnv;
use crate::machine::StateMachine;
use crate::node::{CommandLifecycle, CommandRoute, Node};
use crate::types::ExecutorType;

pub mod backend;
pub mod collection;
pub mod state;

pub use backend::{ActionRunBackend, MAX_RECOVER_TRIES, Outcome};
pub use collection::ActionRunCollection;
pub use state::ActionRunState;

use backend::backend_for;
use state::action_run_table;

pub const EXIT_INVALID_COMMAND: i32 = -1;
pub const EXIT_NODE_ERROR: i32 = -2;
pub const EXIT_STOP_KILL: i32 = -3;
// -4 is left unused: cross-job triggers are not implemented.
pub const EXIT_MESOS_DISABLED: i32 = -5;
pub const EXIT_KUBERNETES_DISABLED: i32 = -6;

/// Substituted for a command that failed to render, so it fails when run.
pub const FAILED_RENDER: &str = "false # Command failed to render correctly. See the Tron error log.";

/// Everything about an action run except how it executes.
#[derive(Debug)]
pub struct RunRecord {
    pub job_name: String,
    pub run_num: u64,
    pub action_name: String,
    pub node: Option<Arc<Node>>,
    pub bare_command: String,
    pub rendered_command: Option<String>,
    pub is_cleanup: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_status: Option<i32>,
    pub retries_remaining: Option<i32>,
    pub exit_statuses: Vec<Option<i32>>,
    pub action_runner: ActionRunner,
    pub cpus: Option<f64>,
    pub mem: Option<f64>,
    pub docker_image: Option<String>,
    machine: StateMachine<ActionRunState>,
}

impl RunRecord {
    pub fn job_run_id(&self) -> String {
        format!("{}.{}", self.job_name, self.run_num)
    }

    pub fn id(&self) -> String {
        format!("{}.{}.{}", self.job_name, self.run_num, self.action_name)
    }

    pub fn route(&self) -> CommandRoute {
        CommandRoute::ActionRun {
            job: self.job_name.clone(),
            run_num: self.run_num,
            action: self.action_name.clone(),
        }
    }

    pub fn state(&self) -> ActionRunState {
        self.machine.state()
    }

    pub fn check(&self, event: &str) -> Option<ActionRunState> {
        self.machine.check(event)
    }

    /// Apply `event`; a cycle in the table is logged and treated as no move.
    pub fn transition(&mut self, event: &str) -> bool {
        match self.machine.transition(event) {
            Ok(moved) => moved,
            Err(err) => {
                error!(action_run = %self.id(), error = %err, "invalid action run transition");
                false
            }
        }
    }

    /// Enter an end state, recording the exit status and end time.
    fn done(&mut self, target: &str, exit_status: Option<i32>, now: DateTime<Utc>) -> bool {
        info!(
            action_run = %self.id(),
            target,
            exit_status = ?exit_status,
            "action run completed"
        );
        if self.check(target).is_none() {
            return false;
        }
        self.exit_status = exit_status;
        self.end_time = Some(now);
        self.transition(target)
    }
}

/// An action run: its record plus the backend it executes on.
#[derive(Debug)]
pub struct ActionRun {
    record: RunRecord,
    backend: Box<dyn ActionRunBackend>,
}

impl ActionRun {
    /// A fresh SCHEDULED run of `action`.
    pub fn build(
        job_name: &str,
        run_num: u64,
        action: &Action,
        node: Option<Arc<Node>>,
        action_runner: ActionRunner,
    ) -> Self {
        let record = RunRecord {
            job_name: job_name.to_string(),
            run_num,
            action_name: action.name.clone(),
            node,
            bare_command: action.command.clone(),
            rendered_command: None,
            is_cleanup: action.is_cleanup(),
            start_time: None,
            end_time: None,
            exit_status: None,
            retries_remaining: action.retries.map(|r| r as i32),
            exit_statuses: Vec::new(),
            action_runner,
            cpus: action.cpus,
            mem: action.mem,
            docker_image: action.docker_image.clone(),
            machine: StateMachine::new(action_run_table(), ActionRunState::Scheduled),
        };
        Self {
            record,
            backend: backend_for(action.executor, None),
        }
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    pub fn id(&self) -> String {
        self.record.id()
    }

    pub fn action_name(&self) -> &str {
        &self.record.action_name
    }

    pub fn state(&self) -> ActionRunState {
        self.record.state()
    }

    pub fn executor(&self) -> ExecutorType {
        self.backend.executor()
    }

    pub fn is_cleanup(&self) -> bool {
        self.record.is_cleanup
    }

    pub fn node(&self) -> Option<&Arc<Node>> {
        self.record.node.as_ref()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.record.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.record.end_time
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.record.exit_status
    }

    pub fn exit_statuses(&self) -> &[Option<i32>] {
        &self.record.exit_statuses
    }

    pub fn retries_remaining(&self) -> Option<i32> {
        self.record.retries_remaining
    }

    pub fn task_id(&self) -> Option<&str> {
        self.backend.task_id()
    }

    pub fn output(&self) -> Option<&StringBufferStore> {
        self.backend.output()
    }

    pub fn check(&self, event: &str) -> bool {
        self.record.check(event).is_some()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_end()
    }

    /// The rendered command, rendered once and then cached. A template that
    /// fails to render yields [`FAILED_RENDER`].
    pub fn command(&mut self, parent: &CommandContext) -> &str {
        if self.record.rendered_command.is_none() {
            let context = CommandContext::chained(
                ActionRunContext {
                    run_id: self.record.job_run_id(),
                    action_name: self.record.action_name.clone(),
                    node: self.record.node.as_ref().map(|n| n.hostname.clone()),
                },
                parent,
            );
            let rendered = match render(&self.record.bare_command, &context) {
                Ok(rendered) => rendered,
                Err(err) => {
                    error!(action_run = %self.id(), error = %err, "failed rendering command");
                    FAILED_RENDER.to_string()
                }
            };
            self.record.rendered_command = Some(rendered);
        }
        self.record.rendered_command.as_deref().unwrap_or(FAILED_RENDER)
    }

    pub fn ready(&mut self) -> bool {
        self.record.transition("ready")
    }

    pub fn queue(&mut self) -> bool {
        self.record.transition("queue")
    }

    pub fn schedule(&mut self) -> bool {
        self.record.transition("schedule")
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if !self.record.transition("cancel") {
            return false;
        }
        self.record.end_time = Some(now);
        true
    }

    pub fn skip(&mut self, now: DateTime<Utc>) -> bool {
        if !self.record.transition("skip") {
            return false;
        }
        self.record.end_time.get_or_insert(now);
        true
    }

    pub fn success(&mut self, now: DateTime<Utc>) -> bool {
        self.record.done("success", Some(0), now)
    }

    /// Force the run to FAILED without retrying.
    pub fn fail(&mut self, exit_status: Option<i32>, now: DateTime<Utc>) -> bool {
        self.record.done("fail", exit_status, now)
    }

    /// Lost contact; the outcome is unknown until recovered.
    pub fn fail_unknown(&mut self, now: DateTime<Utc>) -> bool {
        warn!(action_run = %self.id(), "lost communication with action run");
        self.record.done("fail_unknown", None, now)
    }

    /// Start the run. Returns true if a command was handed to the backend.
    pub fn start(&mut self, parent: &CommandContext, env: &EngineEnv) -> bool {
        if self.record.check("start").is_none() {
            return false;
        }

        if self.record.exit_statuses.is_empty() {
            info!(action_run = %self.id(), "starting action run");
        } else {
            info!(action_run = %self.id(), retry = self.record.exit_statuses.len(), "restarting action run");
        }

        self.record.start_time = Some(env.now());
        self.record.transition("start");

        let command = self.command(parent).to_string();
        if command == FAILED_RENDER {
            error!(action_run = %self.id(), command = %self.record.bare_command, "command is invalid");
            self.exit_unsuccessful(Some(EXIT_INVALID_COMMAND), parent, env);
            return false;
        }
        let Some(wrapped) = self.record.action_runner.wrap(&self.id(), &command) else {
            error!(action_run = %self.id(), "command cannot be wrapped by the action runner");
            self.exit_unsuccessful(Some(EXIT_INVALID_COMMAND), parent, env);
            return false;
        };

        let outcome = self.backend.submit(&mut self.record, &wrapped, env);
        let submitted = outcome == Outcome::Nothing;
        self.apply(outcome, parent, env);
        submitted
    }

    fn restart(&mut self, parent: &CommandContext, env: &EngineEnv) -> bool {
        self.record.machine.reset();
        self.start(parent, env)
    }

    /// A failed attempt: retry if retries remain, otherwise end the run.
    fn exit_unsuccessful(&mut self, exit_status: Option<i32>, parent: &CommandContext, env: &EngineEnv) -> bool {
        if self.is_done() {
            info!(action_run = %self.id(), state = %self.state(), "got exit status while already done");
            return false;
        }

        if let Some(remaining) = self.record.retries_remaining {
            if remaining > 0 {
                self.record.retries_remaining = Some(remaining - 1);
                self.record.exit_statuses.push(exit_status);
                return self.restart(parent, env);
            }
            info!(
                action_run = %self.id(),
                retries = self.record.exit_statuses.len(),
                "reached maximum number of retries"
            );
        }

        let now = env.now();
        match exit_status {
            None if self.record.check("fail_unknown").is_some() => {
                self.record.done("fail_unknown", None, now)
            }
            status => self.record.done("fail", status, now),
        }
    }

    fn apply(&mut self, outcome: Outcome, parent: &CommandContext, env: &EngineEnv) -> bool {
        match outcome {
            Outcome::Nothing => false,
            Outcome::Started => self.record.transition("started"),
            Outcome::Succeeded => self.success(env.now()),
            Outcome::Unsuccessful(status) => self.exit_unsuccessful(status, parent, env),
            Outcome::Unknown => self.fail_unknown(env.now()),
        }
    }

    /// Feed a lifecycle callback from the node or cluster.
    pub fn handle_command(
        &mut self,
        key: &str,
        lifecycle: &CommandLifecycle,
        parent: &CommandContext,
        env: &EngineEnv,
    ) -> bool {
        let outcome = self.backend.handle(&mut self.record, key, lifecycle, env);
        debug!(action_run = %self.id(), key, outcome = ?outcome, "action command update");
        self.apply(outcome, parent, env)
    }

    pub fn stop(&mut self, parent: &CommandContext, env: &EngineEnv) -> String {
        if self.record.retries_remaining.is_some() {
            self.record.retries_remaining = Some(-1);
        }
        let (message, outcome) = self.backend.stop(&self.record, StopSignal::Terminate, env);
        self.apply(outcome, parent, env);
        message
    }

    /// `final_kill` cancels remaining retries; a kill for a manual retry
    /// keeps them.
    pub fn kill(&mut self, final_kill: bool, parent: &CommandContext, env: &EngineEnv) -> String {
        if final_kill && self.record.retries_remaining.is_some() {
            self.record.retries_remaining = Some(-1);
        }
        let (message, outcome) = self.backend.stop(&self.record, StopSignal::Kill, env);
        self.apply(outcome, parent, env);
        message
    }

    /// Operator retry: run again now if done, otherwise kill the current
    /// attempt and let the retry happen when it exits.
    pub fn retry(&mut self, parent: &CommandContext, env: &EngineEnv) -> String {
        if self.record.retries_remaining.is_none_or(|r| r <= 0) {
            self.record.retries_remaining = Some(1);
        }
        if self.is_done() {
            self.record.machine.reset();
            let status = self.record.exit_status;
            self.exit_unsuccessful(status, parent, env);
            format!("Retrying {}", self.id())
        } else {
            info!(action_run = %self.id(), "killing the current attempt for a retry");
            self.kill(false, parent, env)
        }
    }

    pub fn action_runner(&self) -> &ActionRunner {
        &self.record.action_runner
    }

    /// Use `runner` for a run that was restored without one. Returns true
    /// if the runner was adopted.
    pub fn adopt_action_runner(&mut self, runner: &ActionRunner) -> bool {
        if self.record.action_runner.is_enabled() || !runner.is_enabled() {
            return false;
        }
        info!(action_run = %self.id(), "using the master action runner for recovery");
        self.record.action_runner = runner.clone();
        true
    }

    /// Start recovering a lost outcome. Returns true if recovery is under
    /// way.
    pub fn recover(&mut self, env: &EngineEnv) -> bool {
        let outcome = self.backend.recover(&mut self.record, env);
        self.settle_recovery(outcome, env);
        outcome == Outcome::Nothing
    }

    /// Submit the delayed recovery command. A refused submission moves
    /// down the recovery ladder and may leave the run UNKNOWN.
    pub fn submit_recovery(&mut self, env: &EngineEnv) -> bool {
        let outcome = self.backend.submit_recovery(&mut self.record, env);
        self.settle_recovery(outcome, env)
    }

    fn settle_recovery(&mut self, outcome: Outcome, env: &EngineEnv) -> bool {
        // Still UNKNOWN when recovery never got going.
        outcome == Outcome::Unknown
            && self.state() == ActionRunState::Running
            && self.fail_unknown(env.now())
    }

    pub fn needs_recovery(&self) -> bool {
        self.backend.needs_recovery(&self.record)
    }

    /// Snapshot for persistence.
    pub fn state_data(&self) -> ActionRunStateData {
        let r = &self.record;
        ActionRunStateData {
            job_run_id: r.job_run_id(),
            action_name: r.action_name.clone(),
            state: r.state(),
            start_time: r.start_time,
            end_time: r.end_time,
            command: r.rendered_command.clone().unwrap_or_else(|| r.bare_command.clone()),
            bare_command: r.bare_command.clone(),
            rendered_command: r.rendered_command.clone(),
            node_name: r.node.as_ref().map(|n| n.name.clone()),
            exit_status: r.exit_status,
            retries_remaining: r.retries_remaining,
            exit_statuses: r.exit_statuses.clone(),
            action_runner: match &r.action_runner {
                ActionRunner::NoRunner => None,
                ActionRunner::Subprocess {
                    status_path,
                    exec_path,
                } => Some(ActionRunnerData {
                    status_path: status_path.clone(),
                    exec_path: exec_path.clone(),
                }),
            },
            executor: self.backend.executor(),
            cpus: r.cpus,
            mem: r.mem,
            docker_image: r.docker_image.clone(),
            task_id: self.backend.task_id().map(str::to_string),
        }
    }

    /// Rebuild a run from persisted state. A run that was active when the
    /// daemon stopped has lost its callbacks: RUNNING becomes UNKNOWN (so
    /// recovery picks it up) and STARTING becomes FAILED.
    pub fn from_state(
        data: &ActionRunStateData,
        job_name: &str,
        run_num: u64,
        node: Option<Arc<Node>>,
        is_cleanup: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let action_runner = match &data.action_runner {
            Some(runner) => ActionRunner::Subprocess {
                status_path: runner.status_path.clone(),
                exec_path: runner.exec_path.clone(),
            },
            None => ActionRunner::NoRunner,
        };

        let mut machine = StateMachine::new(action_run_table(), ActionRunState::Scheduled);
        machine.force_state(data.state);

        let record = RunRecord {
            job_name: job_name.to_string(),
            run_num,
            action_name: data.action_name.clone(),
            node,
            bare_command: data.bare_command.clone(),
            rendered_command: data.rendered_command.clone(),
            is_cleanup,
            start_time: data.start_time,
            end_time: data.end_time,
            exit_status: data.exit_status,
            retries_remaining: data.retries_remaining,
            exit_statuses: data.exit_statuses.clone(),
            action_runner,
            cpus: data.cpus,
            mem: data.mem,
            docker_image: data.docker_image.clone(),
            machine,
        };
        let mut run = Self {
            record,
            backend: backend_for(data.executor, data.task_id.clone()),
        };

        match run.state() {
            ActionRunState::Running => {
                run.backend.interrupted();
                run.fail_unknown(now);
            }
            ActionRunState::Starting => {
                run.record.done("fail", None, now);
            }
            _ => {}
        }
        run
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRunnerData {
    pub status_path: String,
    pub exec_path: String,
}

/// Persisted form of an [`ActionRun`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRunStateData {
    pub job_run_id: String,
    pub action_name: String,
    pub state: ActionRunState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Rendered command once run, otherwise the template.
    pub command: String,
    /// The template, re-rendered with fresh context after a restore.
    pub bare_command: String,
    #[serde(default)]
    pub rendered_command: Option<String>,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub exit_status: Option<i32>,
    #[serde(default)]
    pub retries_remaining: Option<i32>,
    #[serde(default)]
    pub exit_statuses: Vec<Option<i32>>,
    #[serde(default)]
    pub action_runner: Option<ActionRunnerData>,
    #[serde(default)]
    pub executor: ExecutorType,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub mem: Option<f64>,
    #[serde(default)]
    pub docker_image: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
}
