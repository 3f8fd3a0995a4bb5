// src/engine/env.rs

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, FixedOffset, Offset, Utc};

use crate::action::ActionRunner;
use crate::command_context::CommandContext;
use crate::engine::EngineEvent;
use crate::eventloop::EventLoop;
use crate::fs::{FileSystem, RealFileSystem};
use crate::node::{ClusterRepository, NodePoolStore};
use crate::observer::Observable;

/// Shared services handed down to every job, run and service.
///
/// Built once at startup; nothing in the engine reaches for globals.
#[derive(Debug)]
pub struct EngineEnv {
    pub event_loop: Arc<dyn EventLoop>,
    pub node_pools: NodePoolStore,
    pub clusters: ClusterRepository,
    /// Runner used for new action runs. Restored runs keep their own.
    pub action_runner: ActionRunner,
    /// Offset for daily schedules and command date arithmetic.
    pub time_zone: FixedOffset,
    /// Root of every command context chain (`[command_context]`).
    pub context: CommandContext,
    /// Change notifications for persistence.
    pub notifications: Observable<EngineEvent>,
    /// Where finished action output is written.
    pub fs: Arc<dyn FileSystem>,
    shutdown: AtomicBool,
}

impl EngineEnv {
    pub fn new(event_loop: Arc<dyn EventLoop>, node_pools: NodePoolStore) -> Self {
        Self {
            event_loop,
            node_pools,
            clusters: ClusterRepository::new(),
            action_runner: ActionRunner::NoRunner,
            time_zone: Utc.fix(),
            context: CommandContext::empty(),
            notifications: Observable::new(),
            fs: Arc::new(RealFileSystem),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn with_clusters(mut self, clusters: ClusterRepository) -> Self {
        self.clusters = clusters;
        self
    }

    pub fn with_action_runner(mut self, runner: ActionRunner) -> Self {
        self.action_runner = runner;
        self
    }

    pub fn with_time_zone(mut self, offset: FixedOffset) -> Self {
        self.time_zone = offset;
        self
    }

    pub fn with_context(mut self, context: CommandContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn notify(&self, event: EngineEvent) {
        self.notifications.notify(&event);
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.event_loop.now()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
