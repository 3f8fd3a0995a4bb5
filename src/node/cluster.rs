// src/node/cluster.rs

//! Task clusters (Mesos, Kubernetes) that run an action as a task addressed
//! by id instead of as a command on a node.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::node::{CommandRoute, NodeError};
use crate::types::ExecutorType;

/// A task to launch on a cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    /// `"{action_run_id}.{uuid}"`; lifecycle events echo it back as the key.
    pub task_id: String,
    pub route: CommandRoute,
    pub command: String,
    pub cpus: Option<f64>,
    pub mem: Option<f64>,
    pub docker_image: Option<String>,
}

/// Submits and reconciles tasks. Lifecycle callbacks arrive later as
/// `RuntimeEvent::Command` keyed by task id.
pub trait TaskCluster: Send + Sync + fmt::Debug {
    fn submit(&self, request: TaskRequest) -> Result<(), NodeError>;

    /// Resume watching a task launched before a restart. Returns false if
    /// the cluster does not know the task.
    fn recover(&self, task_id: &str, route: CommandRoute) -> bool;

    /// Returns false if the kill request could not be sent.
    fn kill(&self, task_id: &str) -> bool;
}

/// Clusters by executor type. A missing entry means that executor is
/// disabled.
#[derive(Debug, Clone, Default)]
pub struct ClusterRepository {
    clusters: HashMap<ExecutorType, Arc<dyn TaskCluster>>,
}

impl ClusterRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(mut self, executor: ExecutorType, cluster: Arc<dyn TaskCluster>) -> Self {
        self.clusters.insert(executor, cluster);
        self
    }

    pub fn get(&self, executor: ExecutorType) -> Option<Arc<dyn TaskCluster>> {
        self.clusters.get(&executor).cloned()
    }
}
