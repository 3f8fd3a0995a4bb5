// src/action/mod.rs

//! Static action definitions and their dependency graph.

use std::collections::BTreeSet;

use crate::config::model::ActionConfig;
use crate::types::ExecutorType;

pub mod command;
pub mod graph;
pub mod runner;

pub use command::{ActionCommand, CommandState, StringBufferStore};
pub use graph::ActionGraph;
pub use runner::ActionRunner;

/// Name reserved for a job's cleanup action.
pub const CLEANUP_ACTION_NAME: &str = "cleanup";

/// One configured step of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub name: String,
    /// Unrendered command template.
    pub command: String,
    pub requires: BTreeSet<String>,
    /// Node or pool override; the job's node is used when `None`.
    pub node: Option<String>,
    pub executor: ExecutorType,
    pub retries: Option<u32>,
    pub cpus: Option<f64>,
    pub mem: Option<f64>,
    pub docker_image: Option<String>,
}

impl Action {
    pub fn from_config(name: &str, config: &ActionConfig) -> Self {
        Self {
            name: name.to_string(),
            command: config.command.clone(),
            requires: config.requires.iter().cloned().collect(),
            node: config.node.clone(),
            executor: config.executor,
            retries: config.retries,
            cpus: config.cpus,
            mem: config.mem,
            docker_image: config.docker_image.clone(),
        }
    }

    pub fn is_cleanup(&self) -> bool {
        self.name == CLEANUP_ACTION_NAME
    }
}
