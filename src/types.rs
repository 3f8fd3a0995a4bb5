// src/types.rs

//! Small shared enums used by both the config layer and the engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Execution mechanism behind an action run.
///
/// - `Ssh`: a plain process on a node, reached through the node transport.
/// - `Mesos` / `Kubernetes`: a task on a cluster that reports its own
///   lifecycle and can be re-attached by task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorType {
    Ssh,
    Mesos,
    Kubernetes,
}

impl ExecutorType {
    /// Whether this executor is backed by a task cluster rather than a node.
    pub fn is_task_backend(&self) -> bool {
        !matches!(self, ExecutorType::Ssh)
    }
}

impl Default for ExecutorType {
    fn default() -> Self {
        ExecutorType::Ssh
    }
}

impl fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutorType::Ssh => "ssh",
            ExecutorType::Mesos => "mesos",
            ExecutorType::Kubernetes => "kubernetes",
        };
        f.write_str(name)
    }
}

impl FromStr for ExecutorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ssh" => Ok(ExecutorType::Ssh),
            "mesos" => Ok(ExecutorType::Mesos),
            "kubernetes" => Ok(ExecutorType::Kubernetes),
            other => Err(format!(
                "invalid executor: {other} (expected \"ssh\", \"mesos\" or \"kubernetes\")"
            )),
        }
    }
}

/// How commands are wrapped before being sent to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionRunnerType {
    /// Commands are sent as-is; no status file exists to recover from.
    None,
    /// Commands are wrapped by `action_runner.py`, which records a status
    /// file that the recovery probe can read later.
    Subprocess,
}

impl Default for ActionRunnerType {
    fn default() -> Self {
        ActionRunnerType::None
    }
}
