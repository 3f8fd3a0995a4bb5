// src/action/runner.rs

use std::path::Path;

use crate::config::model::ActionRunnerConfig;
use crate::types::ActionRunnerType;

/// Wraps action commands so their status survives a daemon restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ActionRunner {
    /// Commands run as configured; they cannot be stopped or recovered.
    #[default]
    NoRunner,
    /// Commands run under `action_runner.py`, which writes a status file to
    /// `<status_path>/<id>/status`.
    Subprocess {
        status_path: String,
        exec_path: String,
    },
}

const RUNNER_EXEC_NAME: &str = "action_runner.py";
const STATUS_EXEC_NAME: &str = "action_status.py";
/// The `tron-recover-batch` binary, installed next to the runner scripts.
const RECOVER_EXEC_NAME: &str = "tron-recover-batch";

/// Signal name passed to `action_status.py`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Kill,
}

impl StopSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopSignal::Terminate => "terminate",
            StopSignal::Kill => "kill",
        }
    }
}

fn join(base: &str, name: &str) -> String {
    Path::new(base).join(name).to_string_lossy().into_owned()
}

fn quote(s: &str) -> Option<String> {
    shlex::try_quote(s).ok().map(|q| q.into_owned())
}

impl ActionRunner {
    pub fn from_config(config: &ActionRunnerConfig) -> Self {
        match config.runner_type {
            ActionRunnerType::None => ActionRunner::NoRunner,
            ActionRunnerType::Subprocess => ActionRunner::Subprocess {
                status_path: config.remote_status_path.clone(),
                exec_path: config.remote_exec_path.clone(),
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, ActionRunner::Subprocess { .. })
    }

    /// The command actually submitted for `command`. `None` if the command
    /// cannot be quoted (it contains a NUL byte).
    pub fn wrap(&self, id: &str, command: &str) -> Option<String> {
        match self {
            ActionRunner::NoRunner => Some(command.to_string()),
            ActionRunner::Subprocess { .. } => self.build_command(id, command, RUNNER_EXEC_NAME),
        }
    }

    /// Command that sends `signal` to a running action. `None` without a
    /// runner, since nothing knows the action's pid.
    pub fn stop_command(&self, id: &str, signal: StopSignal) -> Option<String> {
        match self {
            ActionRunner::NoRunner => None,
            ActionRunner::Subprocess { .. } => {
                self.build_command(id, signal.as_str(), STATUS_EXEC_NAME)
            }
        }
    }

    /// `tron-recover-batch` invocation that waits for an action's status
    /// file and exits with its return code.
    pub fn recovery_command(&self, id: &str) -> Option<String> {
        match self {
            ActionRunner::NoRunner => None,
            ActionRunner::Subprocess {
                status_path,
                exec_path,
            } => {
                let status_file = join(&join(status_path, id), "status");
                Some(format!(
                    "{} {}",
                    quote(&join(exec_path, RECOVER_EXEC_NAME))?,
                    quote(&status_file)?
                ))
            }
        }
    }

    fn build_command(&self, id: &str, command: &str, exec_name: &str) -> Option<String> {
        let ActionRunner::Subprocess {
            status_path,
            exec_path,
        } = self
        else {
            return None;
        };
        Some(format!(
            "{} {} {} {}",
            quote(&join(exec_path, exec_name))?,
            quote(&join(status_path, id))?,
            quote(command)?,
            quote(id)?,
        ))
    }
}
