#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use tron::config::{
    ActionConfig, ActionRunnerConfig, ConfigFile, ConfigSection, JobConfig, NodeConfig,
    NodePoolConfig, RawConfigFile, ServiceConfig,
};
use tron::types::{ActionRunnerType, ExecutorType};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                config: ConfigSection::default(),
                command_context: BTreeMap::new(),
                node: BTreeMap::new(),
                node_pool: BTreeMap::new(),
                job: BTreeMap::new(),
                service: BTreeMap::new(),
            },
        }
    }

    pub fn with_node(mut self, name: &str, hostname: &str) -> Self {
        self.config.node.insert(
            name.to_string(),
            NodeConfig {
                hostname: hostname.to_string(),
                username: None,
                port: 22,
            },
        );
        self
    }

    pub fn with_pool(mut self, name: &str, nodes: &[&str]) -> Self {
        self.config.node_pool.insert(
            name.to_string(),
            NodePoolConfig {
                nodes: nodes.iter().map(|n| n.to_string()).collect(),
            },
        );
        self
    }

    pub fn with_context(mut self, key: &str, value: &str) -> Self {
        self.config
            .command_context
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_job(mut self, name: &str, job: JobConfig) -> Self {
        self.config.job.insert(name.to_string(), job);
        self
    }

    pub fn with_service(mut self, name: &str, service: ServiceConfig) -> Self {
        self.config.service.insert(name.to_string(), service);
        self
    }

    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.config.state_path = Some(path.into());
        self
    }

    pub fn with_output_stream_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.config.output_stream_dir = Some(path.into());
        self
    }

    /// Wrap commands with the subprocess action runner.
    pub fn with_action_runner(mut self, status_path: &str, exec_path: &str) -> Self {
        self.config.config.action_runner = ActionRunnerConfig {
            runner_type: ActionRunnerType::Subprocess,
            remote_status_path: status_path.to_string(),
            remote_exec_path: exec_path.to_string(),
        };
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `JobConfig`.
pub struct JobConfigBuilder {
    job: JobConfig,
}

fn action(command: &str) -> ActionConfig {
    ActionConfig {
        command: command.to_string(),
        requires: vec![],
        node: None,
        executor: ExecutorType::Ssh,
        retries: None,
        cpus: None,
        mem: None,
        docker_image: None,
    }
}

impl JobConfigBuilder {
    pub fn new(node: &str, schedule: &str) -> Self {
        Self {
            job: JobConfig {
                node: node.to_string(),
                schedule: schedule.to_string(),
                all_nodes: false,
                allow_overlap: false,
                queueing: true,
                run_limit: 50,
                max_runtime: None,
                enabled: true,
                action: BTreeMap::new(),
                cleanup_action: None,
            },
        }
    }

    pub fn action(mut self, name: &str, command: &str) -> Self {
        self.job.action.insert(name.to_string(), action(command));
        self
    }

    /// Add an action that requires every action in `requires`.
    pub fn action_after(mut self, name: &str, command: &str, requires: &[&str]) -> Self {
        let mut config = action(command);
        config.requires = requires.iter().map(|r| r.to_string()).collect();
        self.job.action.insert(name.to_string(), config);
        self
    }

    /// Change the executor of an action added earlier.
    pub fn executor(mut self, name: &str, executor: ExecutorType) -> Self {
        if let Some(action) = self.job.action.get_mut(name) {
            action.executor = executor;
        }
        self
    }

    /// Set retries on an action added earlier.
    pub fn retries(mut self, name: &str, retries: u32) -> Self {
        if let Some(action) = self.job.action.get_mut(name) {
            action.retries = Some(retries);
        }
        self
    }

    pub fn cleanup(mut self, command: &str) -> Self {
        self.job.cleanup_action = Some(action(command));
        self
    }

    pub fn all_nodes(mut self, val: bool) -> Self {
        self.job.all_nodes = val;
        self
    }

    pub fn allow_overlap(mut self, val: bool) -> Self {
        self.job.allow_overlap = val;
        self
    }

    pub fn queueing(mut self, val: bool) -> Self {
        self.job.queueing = val;
        self
    }

    pub fn run_limit(mut self, limit: usize) -> Self {
        self.job.run_limit = limit;
        self
    }

    pub fn max_runtime(mut self, duration: &str) -> Self {
        self.job.max_runtime = Some(duration.to_string());
        self
    }

    pub fn enabled(mut self, val: bool) -> Self {
        self.job.enabled = val;
        self
    }

    pub fn build(self) -> JobConfig {
        self.job
    }
}

/// Builder for `ServiceConfig`.
pub struct ServiceConfigBuilder {
    service: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn new(node: &str, command: &str, pid_file: &str) -> Self {
        Self {
            service: ServiceConfig {
                node: node.to_string(),
                command: command.to_string(),
                pid_file: pid_file.to_string(),
                count: 1,
                monitor_interval: "30s".to_string(),
                restart_interval: None,
                monitor_retries: None,
            },
        }
    }

    pub fn count(mut self, count: u32) -> Self {
        self.service.count = count;
        self
    }

    pub fn monitor_interval(mut self, duration: &str) -> Self {
        self.service.monitor_interval = duration.to_string();
        self
    }

    pub fn restart_interval(mut self, duration: &str) -> Self {
        self.service.restart_interval = Some(duration.to_string());
        self
    }

    pub fn monitor_retries(mut self, retries: u32) -> Self {
        self.service.monitor_retries = Some(retries);
        self
    }

    pub fn build(self) -> ServiceConfig {
        self.service
    }
}
