// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::action::CLEANUP_ACTION_NAME;
use crate::config::model::{ActionConfig, ConfigFile, JobConfig, RawConfigFile, parse_duration};
use crate::errors::{Result, TronError};
use crate::schedule::parse_schedule;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = TronError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

/// Re-run validation on an already-built config (used after programmatic
/// edits in tests and by `--dry-run`).
pub fn validate_config(cfg: &ConfigFile) -> Result<()> {
    let raw = RawConfigFile {
        config: cfg.config.clone(),
        command_context: cfg.command_context.clone(),
        node: cfg.node.clone(),
        node_pool: cfg.node_pool.clone(),
        job: cfg.job.clone(),
        service: cfg.service.clone(),
    };
    validate_raw_config(&raw)
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_global_config(cfg)?;
    validate_nodes(cfg)?;
    for (name, job) in cfg.job.iter() {
        validate_job(cfg, name, job)?;
    }
    for (name, service) in cfg.service.iter() {
        ensure_node_known(cfg, &format!("service '{name}'"), &service.node)?;
        if service.count == 0 {
            return Err(config_error(format!(
                "service '{name}' must have count >= 1 (got 0)"
            )));
        }
        check_duration(&format!("service '{name}' monitor_interval"), &service.monitor_interval)?;
        if let Some(restart) = &service.restart_interval {
            check_duration(&format!("service '{name}' restart_interval"), restart)?;
        }
    }
    Ok(())
}

fn config_error(msg: String) -> TronError {
    TronError::ConfigError(msg)
}

fn validate_global_config(cfg: &RawConfigFile) -> Result<()> {
    let offset = cfg.config.time_zone_offset_hours;
    if !(-23..=23).contains(&offset) {
        return Err(config_error(format!(
            "[config].time_zone_offset_hours must be within -23..=23 (got {offset})"
        )));
    }
    Ok(())
}

fn validate_nodes(cfg: &RawConfigFile) -> Result<()> {
    for (name, pool) in cfg.node_pool.iter() {
        if cfg.node.contains_key(name) {
            return Err(config_error(format!(
                "node pool '{name}' has the same name as a node"
            )));
        }
        if pool.nodes.is_empty() {
            return Err(config_error(format!("node pool '{name}' has no nodes")));
        }
        for node in pool.nodes.iter() {
            if !cfg.node.contains_key(node) {
                return Err(config_error(format!(
                    "node pool '{name}' references unknown node '{node}'"
                )));
            }
        }
    }
    Ok(())
}

fn ensure_node_known(cfg: &RawConfigFile, owner: &str, node: &str) -> Result<()> {
    if cfg.node.contains_key(node) || cfg.node_pool.contains_key(node) {
        return Ok(());
    }
    Err(config_error(format!(
        "{owner} references unknown node or node pool '{node}'"
    )))
}

fn check_duration(what: &str, value: &str) -> Result<()> {
    parse_duration(value)
        .map(|_| ())
        .map_err(|e| config_error(format!("{what}: {e}")))
}

fn validate_job(cfg: &RawConfigFile, name: &str, job: &JobConfig) -> Result<()> {
    let owner = format!("job '{name}'");
    ensure_node_known(cfg, &owner, &job.node)?;

    if job.action.is_empty() {
        return Err(config_error(format!("{owner} must define at least one action")));
    }
    if job.run_limit == 0 {
        return Err(config_error(format!("{owner} must have run_limit >= 1 (got 0)")));
    }
    parse_schedule(&job.schedule).map_err(|e| config_error(format!("{owner}: {e}")))?;
    if let Some(max_runtime) = &job.max_runtime {
        check_duration(&format!("{owner} max_runtime"), max_runtime)?;
    }

    for (action_name, action) in job.action.iter() {
        if action_name == CLEANUP_ACTION_NAME {
            return Err(config_error(format!(
                "{owner}: action name '{CLEANUP_ACTION_NAME}' is reserved for cleanup_action"
            )));
        }
        validate_action(cfg, &owner, action_name, action)?;
        for dep in action.requires.iter() {
            if dep == action_name {
                return Err(config_error(format!(
                    "{owner}: action '{action_name}' cannot require itself"
                )));
            }
            if !job.action.contains_key(dep) {
                return Err(config_error(format!(
                    "{owner}: action '{action_name}' has unknown dependency '{dep}' in `requires`"
                )));
            }
        }
    }

    if let Some(cleanup) = &job.cleanup_action {
        if !cleanup.requires.is_empty() {
            return Err(config_error(format!(
                "{owner}: cleanup_action cannot have `requires`"
            )));
        }
        validate_action(cfg, &owner, CLEANUP_ACTION_NAME, cleanup)?;
    }

    validate_action_graph(name, job)
}

fn validate_action(
    cfg: &RawConfigFile,
    owner: &str,
    action_name: &str,
    action: &ActionConfig,
) -> Result<()> {
    if action.command.trim().is_empty() {
        return Err(config_error(format!(
            "{owner}: action '{action_name}' has an empty command"
        )));
    }
    if let Some(node) = &action.node {
        ensure_node_known(cfg, &format!("{owner} action '{action_name}'"), node)?;
    }
    Ok(())
}

fn validate_action_graph(job_name: &str, job: &JobConfig) -> Result<()> {
    // Edge direction: requirement -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in job.action.keys() {
        graph.add_node(name.as_str());
    }
    for (name, action) in job.action.iter() {
        for dep in action.requires.iter() {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(TronError::DagCycle(format!(
            "cycle detected in job '{}' involving action '{}'",
            job_name,
            cycle.node_id()
        ))),
    }
}
