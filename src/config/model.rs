// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{ActionRunnerType, ExecutorType};

/// Configuration exactly as read from a TOML file, before validation.
///
/// ```toml
/// [config]
/// state_path = "/var/lib/tron/state.json"
/// time_zone_offset_hours = 0
///
/// [config.action_runner]
/// runner_type = "subprocess"
/// remote_status_path = "/tmp/tron"
/// remote_exec_path = "/opt/tron/bin"
///
/// [command_context]
/// ROOT = "/srv/batch"
///
/// [node.batch1]
/// hostname = "batch1.example.com"
///
/// [job.etl]
/// node = "batch1"
/// schedule = "daily 04:00:00"
///
/// [job.etl.action.fetch]
/// command = "%(ROOT)s/fetch --date %(shortdate-1)s"
///
/// [job.etl.action.transform]
/// command = "%(ROOT)s/transform"
/// requires = ["fetch"]
///
/// [job.etl.cleanup_action]
/// command = "%(ROOT)s/cleanup"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub config: ConfigSection,

    /// Root of every command context chain.
    #[serde(default)]
    pub command_context: BTreeMap<String, String>,

    #[serde(default)]
    pub node: BTreeMap<String, NodeConfig>,

    #[serde(default)]
    pub node_pool: BTreeMap<String, NodePoolConfig>,

    #[serde(default)]
    pub job: BTreeMap<String, JobConfig>,

    #[serde(default)]
    pub service: BTreeMap<String, ServiceConfig>,
}

/// A validated configuration. Only obtainable through
/// `ConfigFile::try_from(RawConfigFile)` (see `validate.rs`).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub config: ConfigSection,
    pub command_context: BTreeMap<String, String>,
    pub node: BTreeMap<String, NodeConfig>,
    pub node_pool: BTreeMap<String, NodePoolConfig>,
    pub job: BTreeMap<String, JobConfig>,
    pub service: BTreeMap<String, ServiceConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            config: raw.config,
            command_context: raw.command_context,
            node: raw.node,
            node_pool: raw.node_pool,
            job: raw.job,
            service: raw.service,
        }
    }
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigSection {
    /// Where the JSON state file lives. No persistence when unset.
    #[serde(default)]
    pub state_path: Option<PathBuf>,

    #[serde(default)]
    pub action_runner: ActionRunnerConfig,

    /// Fixed offset used for daily schedules and date arithmetic.
    #[serde(default)]
    pub time_zone_offset_hours: i32,

    /// Directory for captured command output.
    #[serde(default)]
    pub output_stream_dir: Option<PathBuf>,
}

/// `[config.action_runner]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionRunnerConfig {
    #[serde(default)]
    pub runner_type: ActionRunnerType,

    #[serde(default = "default_remote_status_path")]
    pub remote_status_path: String,

    #[serde(default)]
    pub remote_exec_path: String,
}

fn default_remote_status_path() -> String {
    "/tmp".to_string()
}

impl Default for ActionRunnerConfig {
    fn default() -> Self {
        Self {
            runner_type: ActionRunnerType::default(),
            remote_status_path: default_remote_status_path(),
            remote_exec_path: String::new(),
        }
    }
}

/// `[node.<name>]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    pub hostname: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    22
}

/// `[node_pool.<name>]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NodePoolConfig {
    pub nodes: Vec<String>,
}

/// `[job.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// Node or node pool the job runs on.
    pub node: String,

    /// `"constant"`, `"interval 5m"` or `"daily 04:00:00 MTWRF"`.
    pub schedule: String,

    /// Build one run per node of the pool instead of picking one node.
    #[serde(default)]
    pub all_nodes: bool,

    #[serde(default)]
    pub allow_overlap: bool,

    /// Queue (true) or cancel (false) a run that would overlap.
    #[serde(default = "default_true")]
    pub queueing: bool,

    #[serde(default = "default_run_limit")]
    pub run_limit: usize,

    /// Duration string; runs still active after this long are stopped.
    #[serde(default)]
    pub max_runtime: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub action: BTreeMap<String, ActionConfig>,

    #[serde(default)]
    pub cleanup_action: Option<ActionConfig>,
}

fn default_true() -> bool {
    true
}

fn default_run_limit() -> usize {
    50
}

impl JobConfig {
    pub fn max_runtime_duration(&self) -> Option<Duration> {
        self.max_runtime
            .as_deref()
            .and_then(|s| parse_duration(s).ok())
    }
}

/// `[job.<name>.action.<action>]` and `[job.<name>.cleanup_action]`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ActionConfig {
    pub command: String,

    /// Actions that must succeed (or be skipped) first.
    #[serde(default)]
    pub requires: Vec<String>,

    /// Overrides the job's node for this action.
    #[serde(default)]
    pub node: Option<String>,

    #[serde(default)]
    pub executor: ExecutorType,

    #[serde(default)]
    pub retries: Option<u32>,

    #[serde(default)]
    pub cpus: Option<f64>,

    #[serde(default)]
    pub mem: Option<f64>,

    #[serde(default)]
    pub docker_image: Option<String>,
}

/// `[service.<name>]` section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub node: String,
    pub command: String,
    pub pid_file: String,

    #[serde(default = "default_count")]
    pub count: u32,

    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: String,

    /// Delay before a failed service is repaired. No automatic repair when
    /// unset.
    #[serde(default)]
    pub restart_interval: Option<String>,

    /// Monitor failures tolerated before the instance is stopped.
    #[serde(default)]
    pub monitor_retries: Option<u32>,
}

fn default_count() -> u32 {
    1
}

fn default_monitor_interval() -> String {
    "30s".to_string()
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"5m"`, `"2h"`
/// or `"1d"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' is missing a unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{num_part}': {e}"))?;

    match unit_part.trim().to_lowercase().as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        "d" => Ok(Duration::from_secs(value * 60 * 60 * 24)),
        unit => Err(format!(
            "unsupported duration unit '{unit}'; expected ms, s, m, h or d"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration(" 5m "), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1d"), Ok(Duration::from_secs(86_400)));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("3 weeks").is_err());
    }

    #[test]
    fn job_defaults_apply() {
        let job: JobConfig = toml::from_str(
            r#"
            node = "n"
            schedule = "constant"
            [action.a]
            command = "true"
            "#,
        )
        .unwrap();
        assert!(job.queueing);
        assert!(job.enabled);
        assert!(!job.allow_overlap);
        assert_eq!(job.run_limit, 50);
        assert_eq!(job.action["a"].executor, ExecutorType::Ssh);
        assert_eq!(job.max_runtime_duration(), None);
    }
}
