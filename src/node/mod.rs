// src/node/mod.rs

//! Execution targets.
//!
//! A [`Node`] is one remote host. Many action runs share a node, so nodes
//! are handed around as `Arc<Node>` and owned by the [`NodePoolStore`],
//! which is built once from config and passed down explicitly.
//!
//! Submitting a command is synchronous and only fails if the command cannot
//! even be handed to the transport. Everything after that (started, output,
//! exit, done) arrives later as `RuntimeEvent::Command` tagged with the
//! request's [`CommandRoute`] and key.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tracing::debug;

pub mod cluster;
pub mod process;

pub use cluster::{ClusterRepository, TaskCluster, TaskRequest};
pub use process::ProcessTransport;

/// Which engine object a command's lifecycle events belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandRoute {
    ActionRun {
        job: String,
        run_num: u64,
        action: String,
    },
    ServiceTask {
        service: String,
        instance: u32,
        task: ServiceTask,
    },
}

/// The three kinds of command a service instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceTask {
    Monitor,
    Start,
    Stop,
}

/// Lifecycle callbacks reported by a transport for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLifecycle {
    Started,
    Stdout(String),
    Stderr(String),
    /// The process ended. `None` means the outcome could not be observed.
    Exited(Option<i32>),
    /// No further events will follow.
    Done,
}

/// A command handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Unique per submission; lifecycle events echo it back.
    pub key: String,
    pub route: CommandRoute,
    pub command: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("node '{node}' is unreachable: {reason}")]
    Unreachable { node: String, reason: String },

    #[error("node '{node}' is shutting down")]
    ShuttingDown { node: String },
}

/// Moves commands to a host and reports their lifecycle back to the engine.
pub trait NodeTransport: Send + Sync + fmt::Debug {
    fn submit(&self, node: &Node, request: CommandRequest) -> Result<(), NodeError>;

    /// Ask the transport to terminate a running command. Unknown keys are
    /// ignored.
    fn stop(&self, node: &Node, key: &str);
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub hostname: String,
    pub username: Option<String>,
    pub port: u16,
    transport: Arc<dyn NodeTransport>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        hostname: impl Into<String>,
        username: Option<String>,
        port: u16,
        transport: Arc<dyn NodeTransport>,
    ) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            username,
            port,
            transport,
        }
    }

    /// Commands for local nodes run without ssh.
    pub fn is_local(&self) -> bool {
        matches!(self.hostname.as_str(), "localhost" | "127.0.0.1")
    }

    pub fn submit_command(&self, request: CommandRequest) -> Result<(), NodeError> {
        debug!(node = %self.name, key = %request.key, command = %request.command, "submitting command");
        self.transport.submit(self, request)
    }

    pub fn stop(&self, key: &str) {
        self.transport.stop(self, key);
    }
}

/// A named group of nodes, picked round-robin.
#[derive(Debug)]
pub struct NodePool {
    name: String,
    nodes: Vec<Arc<Node>>,
    cursor: AtomicUsize,
}

impl NodePool {
    pub fn new(name: impl Into<String>, nodes: Vec<Arc<Node>>) -> Self {
        Self {
            name: name.into(),
            nodes,
            cursor: AtomicUsize::new(0),
        }
    }

    /// A pool holding exactly one node, named after it.
    pub fn single(node: Arc<Node>) -> Self {
        Self::new(node.name.clone(), vec![node])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn next(&self) -> Option<Arc<Node>> {
        if self.nodes.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
        Some(Arc::clone(&self.nodes[idx]))
    }

    pub fn get_by_hostname(&self, hostname: &str) -> Option<Arc<Node>> {
        self.nodes.iter().find(|n| n.hostname == hostname).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.iter().find(|n| n.name == name).cloned()
    }
}

/// Every node and pool known to the daemon. Each node is also registered
/// as a pool of one under its own name.
#[derive(Debug, Default)]
pub struct NodePoolStore {
    nodes: HashMap<String, Arc<Node>>,
    pools: HashMap<String, Arc<NodePool>>,
}

impl NodePoolStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Node) -> Arc<Node> {
        let node = Arc::new(node);
        self.pools.insert(
            node.name.clone(),
            Arc::new(NodePool::single(Arc::clone(&node))),
        );
        self.nodes.insert(node.name.clone(), Arc::clone(&node));
        node
    }

    pub fn add_pool(&mut self, pool: NodePool) -> Arc<NodePool> {
        let pool = Arc::new(pool);
        self.pools.insert(pool.name().to_string(), Arc::clone(&pool));
        pool
    }

    pub fn get_pool(&self, name: &str) -> Option<Arc<NodePool>> {
        self.pools.get(name).cloned()
    }

    pub fn get_node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(name).cloned()
    }

    /// Find a node by name, falling back to any node with that hostname.
    pub fn find_node(&self, name_or_hostname: &str) -> Option<Arc<Node>> {
        self.get_node(name_or_hostname).or_else(|| {
            self.nodes
                .values()
                .find(|n| n.hostname == name_or_hostname)
                .cloned()
        })
    }
}
