// src/actionrun/backend.rs

//! How an action run actually executes: as a command on a node (SSH) or as
//! a task on a cluster (Mesos, Kubernetes).
//!
//! Backends never drive retries or completion themselves. They report an
//! [`Outcome`] and [`ActionRun`](super::ActionRun) applies it, so the retry
//! ladder and end-state bookkeeping live in one place.

use std::fmt;
use std::time::Duration;

use tracing::{info, warn};

use crate::action::command::CommandState;
use crate::action::runner::StopSignal;
use crate::action::{ActionCommand, StringBufferStore};
use crate::actionrun::state::ActionRunState;
use crate::actionrun::{EXIT_KUBERNETES_DISABLED, EXIT_MESOS_DISABLED, EXIT_NODE_ERROR, EXIT_STOP_KILL, RunRecord};
use crate::engine::env::EngineEnv;
use crate::eventloop::TimerEvent;
use crate::node::{CommandLifecycle, CommandRequest, TaskRequest};
use crate::types::ExecutorType;

/// Recovery probes are attempted this many times before giving up.
pub const MAX_RECOVER_TRIES: u32 = 5;
/// Delay before the first retried probe, tripled on each further try.
pub const INITIAL_RECOVER_DELAY: Duration = Duration::from_secs(3);

/// What a backend observed, for the action run to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing that changes the run's state.
    Nothing,
    Started,
    Succeeded,
    /// Failed with this exit status; retries may apply.
    Unsuccessful(Option<i32>),
    /// Contact lost and nothing left to try.
    Unknown,
}

pub trait ActionRunBackend: Send + fmt::Debug {
    fn executor(&self) -> ExecutorType;

    /// Hand the (wrapped, rendered) command to the execution target.
    fn submit(&mut self, run: &mut RunRecord, command: &str, env: &EngineEnv) -> Outcome;

    /// One lifecycle callback for a key this backend handed out.
    fn handle(
        &mut self,
        run: &mut RunRecord,
        key: &str,
        lifecycle: &CommandLifecycle,
        env: &EngineEnv,
    ) -> Outcome;

    /// Ask the target to terminate the running command. Returns an
    /// operator-facing message.
    fn stop(&mut self, run: &RunRecord, signal: StopSignal, env: &EngineEnv) -> (String, Outcome);

    /// Re-attach to work whose outcome was lost. Only valid from UNKNOWN.
    /// `Outcome::Nothing` means recovery is under way; `Outcome::Unknown`
    /// means the outcome stays lost.
    fn recover(&mut self, run: &mut RunRecord, env: &EngineEnv) -> Outcome;

    /// Submit a recovery probe that was delayed by the retry ladder.
    fn submit_recovery(&mut self, _run: &mut RunRecord, _env: &EngineEnv) -> Outcome {
        Outcome::Nothing
    }

    /// Whether startup recovery should pick this run up.
    fn needs_recovery(&self, run: &RunRecord) -> bool;

    /// The run was active when the daemon stopped and is being restored
    /// as UNKNOWN.
    fn interrupted(&mut self) {}

    /// Remote task id, persisted so recovery can re-attach.
    fn task_id(&self) -> Option<&str> {
        None
    }

    /// Output captured for the current command, if any.
    fn output(&self) -> Option<&StringBufferStore> {
        None
    }
}

/// Build the backend for an executor type.
pub fn backend_for(executor: ExecutorType, task_id: Option<String>) -> Box<dyn ActionRunBackend> {
    match executor {
        ExecutorType::Ssh => Box::new(SshBackend::default()),
        ExecutorType::Mesos | ExecutorType::Kubernetes => {
            Box::new(TaskBackend {
                executor,
                task_id,
                interrupted: false,
            })
        }
    }
}

/// Runs the command on the run's node and recovers lost commands by probing
/// the action runner's status file.
#[derive(Debug, Default)]
pub struct SshBackend {
    action_command: Option<ActionCommand>,
    recovery_command: Option<ActionCommand>,
    recover_tries: u32,
}

impl SshBackend {
    pub fn recover_tries(&self) -> u32 {
        self.recover_tries
    }

    fn handle_unknown(&mut self, run: &mut RunRecord, env: &EngineEnv) -> Outcome {
        if !run.action_runner.is_enabled() {
            info!(action_run = %run.id(), "unable to recover action run without an action runner");
            return Outcome::Unknown;
        }
        if self.recover_tries >= MAX_RECOVER_TRIES {
            info!(action_run = %run.id(), tries = MAX_RECOVER_TRIES, "reached maximum recovery tries");
            return Outcome::Unknown;
        }

        let delay = INITIAL_RECOVER_DELAY * 3u32.pow(self.recover_tries);
        self.recover_tries += 1;
        info!(
            action_run = %run.id(),
            attempt = self.recover_tries,
            delay_secs = delay.as_secs(),
            "scheduling recovery probe"
        );
        self.do_recover(run, env, delay)
    }

    fn do_recover(&mut self, run: &mut RunRecord, env: &EngineEnv, delay: Duration) -> Outcome {
        let id = run.id();
        let Some(command) = run.action_runner.recovery_command(&id) else {
            return Outcome::Unknown;
        };

        let mut probe = ActionCommand::new(format!("recovery-{id}"), command);
        probe.write_stdout(&format!("Recovering action run {id}"));
        // Already running: a probe that cannot connect exits without a status
        // and lands back in the retry ladder instead of failing the run.
        probe.started(env.now());
        self.recovery_command = Some(probe);

        run.exit_status = None;
        run.end_time = None;
        run.transition("running");

        if delay.is_zero() {
            return self.send_recovery(run, env);
        }
        env.event_loop.call_later(
            delay,
            TimerEvent::SubmitRecovery {
                job: run.job_name.clone(),
                run_num: run.run_num,
                action: run.action_name.clone(),
            },
        );
        Outcome::Nothing
    }

    /// A recovery command the node refuses counts as one more lost outcome.
    fn send_recovery(&mut self, run: &mut RunRecord, env: &EngineEnv) -> Outcome {
        let Some(probe) = self.recovery_command.as_ref() else {
            return Outcome::Nothing;
        };
        let request = CommandRequest {
            key: probe.key.clone(),
            route: run.route(),
            command: probe.command.clone(),
        };
        let submitted = match run.node.clone() {
            Some(node) => {
                info!(action_run = %run.id(), command = %request.command, node = %node.name, "submitting recovery probe");
                match node.submit_command(request) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(action_run = %run.id(), error = %err, "failed to submit recovery");
                        false
                    }
                }
            }
            None => {
                warn!(action_run = %run.id(), "no node to submit recovery to");
                false
            }
        };
        if submitted {
            Outcome::Nothing
        } else {
            self.handle_unknown(run, env)
        }
    }

    fn map_command_state(&mut self, run: &mut RunRecord, state: CommandState, exit_status: Option<i32>, env: &EngineEnv) -> Outcome {
        match state {
            CommandState::Running => Outcome::Started,
            CommandState::Failstart => Outcome::Unsuccessful(Some(EXIT_NODE_ERROR)),
            CommandState::Exiting => match exit_status {
                None => self.handle_unknown(run, env),
                Some(0) => Outcome::Succeeded,
                Some(status) => Outcome::Unsuccessful(Some(status)),
            },
            CommandState::Pending | CommandState::Complete => Outcome::Nothing,
        }
    }
}

impl ActionRunBackend for SshBackend {
    fn executor(&self) -> ExecutorType {
        ExecutorType::Ssh
    }

    fn submit(&mut self, run: &mut RunRecord, command: &str, _env: &EngineEnv) -> Outcome {
        let action_command = ActionCommand::new(run.id(), command);
        let request = CommandRequest {
            key: action_command.key.clone(),
            route: run.route(),
            command: command.to_string(),
        };
        self.action_command = Some(action_command);

        let Some(node) = run.node.clone() else {
            warn!(action_run = %run.id(), "no node to run on");
            return Outcome::Unsuccessful(Some(EXIT_NODE_ERROR));
        };
        match node.submit_command(request) {
            Ok(()) => Outcome::Nothing,
            Err(err) => {
                warn!(action_run = %run.id(), error = %err, "failed to start");
                Outcome::Unsuccessful(Some(EXIT_NODE_ERROR))
            }
        }
    }

    fn handle(
        &mut self,
        run: &mut RunRecord,
        key: &str,
        lifecycle: &CommandLifecycle,
        env: &EngineEnv,
    ) -> Outcome {
        let now = env.now();
        let command = [self.action_command.as_mut(), self.recovery_command.as_mut()]
            .into_iter()
            .flatten()
            .find(|c| c.key == key);
        let Some(command) = command else {
            return Outcome::Nothing;
        };
        let Some(state) = command.handle(lifecycle, now) else {
            return Outcome::Nothing;
        };
        let exit_status = command.exit_status;
        self.map_command_state(run, state, exit_status, env)
    }

    fn stop(&mut self, run: &RunRecord, signal: StopSignal, _env: &EngineEnv) -> (String, Outcome) {
        let id = run.id();
        let Some(command) = run.action_runner.stop_command(&id, signal) else {
            return (
                format!("Cannot {} {id}: an action runner is required", signal.as_str()),
                Outcome::Nothing,
            );
        };
        let Some(node) = run.node.clone() else {
            return (format!("Cannot {} {id}: no node", signal.as_str()), Outcome::Nothing);
        };
        let request = CommandRequest {
            key: format!("{id}.{}", signal.as_str()),
            route: run.route(),
            command,
        };
        match node.submit_command(request) {
            Ok(()) => (format!("Sent {} to {id}", signal.as_str()), Outcome::Nothing),
            Err(err) => (format!("Failed to {} {id}: {err}", signal.as_str()), Outcome::Nothing),
        }
    }

    fn recover(&mut self, run: &mut RunRecord, env: &EngineEnv) -> Outcome {
        info!(action_run = %run.id(), "creating recovery run");
        if !run.action_runner.is_enabled() {
            info!(action_run = %run.id(), "unable to recover action run without an action runner");
            return Outcome::Unknown;
        }
        if run.check("running").is_none() {
            warn!(
                action_run = %run.id(),
                state = %run.state(),
                "only unknown action runs can be recovered"
            );
            return Outcome::Unknown;
        }
        self.do_recover(run, env, Duration::ZERO)
    }

    fn submit_recovery(&mut self, run: &mut RunRecord, env: &EngineEnv) -> Outcome {
        // Resolved some other way while the timer was pending.
        if run.state() != ActionRunState::Running {
            return Outcome::Nothing;
        }
        self.send_recovery(run, env)
    }

    fn needs_recovery(&self, run: &RunRecord) -> bool {
        run.state() == ActionRunState::Unknown
    }

    fn output(&self) -> Option<&StringBufferStore> {
        self.action_command.as_ref().map(ActionCommand::output)
    }
}

/// Runs the command as a task on a Mesos or Kubernetes cluster.
#[derive(Debug)]
pub struct TaskBackend {
    executor: ExecutorType,
    task_id: Option<String>,
    /// Lost its callbacks to a restart; the cluster may still know the task.
    interrupted: bool,
}

impl TaskBackend {
    fn disabled_status(&self) -> i32 {
        match self.executor {
            ExecutorType::Kubernetes => EXIT_KUBERNETES_DISABLED,
            _ => EXIT_MESOS_DISABLED,
        }
    }
}

impl ActionRunBackend for TaskBackend {
    fn executor(&self) -> ExecutorType {
        self.executor
    }

    fn submit(&mut self, run: &mut RunRecord, command: &str, env: &EngineEnv) -> Outcome {
        let Some(cluster) = env.clusters.get(self.executor) else {
            warn!(action_run = %run.id(), executor = %self.executor, "executor is disabled");
            return Outcome::Unsuccessful(Some(self.disabled_status()));
        };

        let task_id = format!("{}.{}", run.id(), uuid::Uuid::new_v4().simple());
        self.task_id = Some(task_id.clone());
        let request = TaskRequest {
            task_id,
            route: run.route(),
            command: command.to_string(),
            cpus: run.cpus,
            mem: run.mem,
            docker_image: run.docker_image.clone(),
        };
        match cluster.submit(request) {
            Ok(()) => Outcome::Nothing,
            Err(err) => {
                warn!(action_run = %run.id(), error = %err, "failed to submit task");
                Outcome::Unsuccessful(Some(EXIT_NODE_ERROR))
            }
        }
    }

    fn handle(
        &mut self,
        _run: &mut RunRecord,
        key: &str,
        lifecycle: &CommandLifecycle,
        _env: &EngineEnv,
    ) -> Outcome {
        if self.task_id.as_deref() != Some(key) {
            return Outcome::Nothing;
        }
        match lifecycle {
            CommandLifecycle::Started => Outcome::Started,
            CommandLifecycle::Exited(Some(0)) => Outcome::Succeeded,
            // A lost task exits without a status; retries still apply.
            CommandLifecycle::Exited(status) => Outcome::Unsuccessful(*status),
            _ => Outcome::Nothing,
        }
    }

    fn stop(&mut self, run: &RunRecord, _signal: StopSignal, env: &EngineEnv) -> (String, Outcome) {
        let mut msgs = Vec::new();
        if !run.state().is_active() {
            msgs.push(format!("Action is {}, not running. Continuing anyway.", run.state()));
        }
        let Some(task_id) = self.task_id.clone() else {
            msgs.push("Error: can't find task id for the action.".to_string());
            let outcome = if run.state().is_active() {
                Outcome::Unsuccessful(Some(EXIT_STOP_KILL))
            } else {
                Outcome::Nothing
            };
            return (msgs.join("\n"), outcome);
        };
        let sent = env
            .clusters
            .get(self.executor)
            .is_some_and(|cluster| cluster.kill(&task_id));
        if sent {
            msgs.push(format!("Sent kill for {task_id}."));
        } else {
            msgs.push(format!("Error while sending kill for {task_id}. Please try again."));
        }
        (msgs.join("\n"), Outcome::Nothing)
    }

    fn recover(&mut self, run: &mut RunRecord, env: &EngineEnv) -> Outcome {
        if run.check("running").is_none() {
            warn!(action_run = %run.id(), state = %run.state(), "unable to transition to running for recovery");
            return Outcome::Unknown;
        }
        let Some(task_id) = self.task_id.clone() else {
            warn!(action_run = %run.id(), "no task id, cannot recover");
            return Outcome::Unknown;
        };
        let Some(cluster) = env.clusters.get(self.executor) else {
            warn!(action_run = %run.id(), executor = %self.executor, "cannot recover, executor is disabled");
            return Outcome::Unknown;
        };
        info!(action_run = %run.id(), task_id = %task_id, "recovering task");
        if !cluster.recover(&task_id, run.route()) {
            warn!(action_run = %run.id(), task_id = %task_id, "cluster does not know the task");
            return Outcome::Unknown;
        }

        self.interrupted = false;
        run.exit_status = None;
        run.end_time = None;
        run.transition("running");
        Outcome::Nothing
    }

    // A task that went UNKNOWN while the daemon was watching already had its
    // final word from the cluster. Only restart-interrupted tasks are asked
    // again.
    fn needs_recovery(&self, run: &RunRecord) -> bool {
        run.state() == ActionRunState::Unknown && self.interrupted
    }

    fn interrupted(&mut self) {
        self.interrupted = true;
    }

    fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }
}
