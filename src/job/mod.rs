// src/job/mod.rs

//! Jobs: a scheduling policy plus an action graph, and the runs built from
//! them.
//!
//! [`Job`] holds what comes from config together with the enabled flag and
//! run history; [`JobScheduler`] decides when runs are built, started,
//! queued or cancelled.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::action::ActionGraph;
use crate::command_context::{CommandContext, JobContext};
use crate::config::model::JobConfig;
use crate::engine::env::EngineEnv;
use crate::errors::{Result, TronError};
use crate::node::NodePool;
use crate::schedule::{SchedulerPolicy, parse_schedule};

pub mod collection;
pub mod run;
pub mod scheduler;

pub use collection::JobRunCollection;
pub use run::{JobRun, JobRunNotification, JobRunStateData};
pub use scheduler::JobScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Disabled,
    Enabled,
    Running,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Disabled => "DISABLED",
            JobStatus::Enabled => "ENABLED",
            JobStatus::Running => "RUNNING",
        };
        f.write_str(s)
    }
}

/// Persisted form of a [`Job`]. Runs are stored separately, keyed by
/// `"{job}.{run_num}"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateData {
    pub enabled: bool,
    #[serde(default)]
    pub run_nums: Vec<u64>,
}

#[derive(Debug)]
pub struct Job {
    pub name: String,
    pub scheduler: Arc<dyn SchedulerPolicy>,
    pub node_pool: Arc<NodePool>,
    pub all_nodes: bool,
    pub allow_overlap: bool,
    pub queueing: bool,
    pub max_runtime: Option<Duration>,
    /// Shared by every run built from this generation of the config.
    pub graph: Arc<ActionGraph>,
    pub enabled: bool,
    pub context: CommandContext,
    /// Where action output is written, if configured.
    pub output_path: Option<PathBuf>,
    pub runs: JobRunCollection,
}

impl Job {
    pub fn from_config(
        name: &str,
        config: &JobConfig,
        output_dir: Option<&PathBuf>,
        env: &EngineEnv,
    ) -> Result<Self> {
        let node_pool = env.node_pools.get_pool(&config.node).ok_or_else(|| {
            TronError::ConfigError(format!("job '{name}' uses unknown node '{}'", config.node))
        })?;
        let scheduler = parse_schedule(&config.schedule)
            .map_err(|e| TronError::ConfigError(format!("job '{name}': {e}")))?
            .build(env.time_zone);

        Ok(Self {
            name: name.to_string(),
            scheduler,
            node_pool,
            all_nodes: config.all_nodes,
            allow_overlap: config.allow_overlap,
            queueing: config.queueing,
            max_runtime: config.max_runtime_duration(),
            graph: Arc::new(ActionGraph::from_config(config)),
            enabled: config.enabled,
            context: CommandContext::chained(
                JobContext {
                    name: name.to_string(),
                },
                &env.context,
            ),
            output_path: output_dir.map(|dir| dir.join(name)),
            runs: JobRunCollection::new(config.run_limit),
        })
    }

    /// Output directory of one run, `<output_stream_dir>/<job>/<run_num>`.
    pub fn run_output_dir(&self, run_num: u64) -> Option<PathBuf> {
        self.output_path
            .as_ref()
            .map(|dir| dir.join(run_num.to_string()))
    }

    pub fn status(&self) -> JobStatus {
        if self.runs.get_active(None).next().is_some() {
            JobStatus::Running
        } else if self.enabled {
            JobStatus::Enabled
        } else {
            JobStatus::Disabled
        }
    }

    pub fn state_data(&self) -> JobStateData {
        JobStateData {
            enabled: self.enabled,
            run_nums: self.runs.run_nums(),
        }
    }

    /// Store key of one of this job's runs.
    pub fn run_key(&self, run_num: u64) -> String {
        format!("{}.{run_num}", self.name)
    }
}
