#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use tron::config::ConfigFile;
use tron::engine::{AdminCommand, CoreRuntime, CoreStep, RuntimeEvent};
use tron::eventloop::ManualEventLoop;
use tron::fs::FileSystem;
use tron::fs::mock::MockFileSystem;
use tron::node::{ClusterRepository, CommandLifecycle, CommandRequest, NodeTransport};
use tron::serialize::RestoredState;

use crate::fakes::FakeTransport;

/// Drives a `CoreRuntime` step by step on a manual clock.
///
/// Commands go to a [`FakeTransport`]; timers stay in the
/// [`ManualEventLoop`] until the test moves the clock.
pub struct Harness {
    pub core: CoreRuntime,
    pub event_loop: Arc<ManualEventLoop>,
    pub transport: Arc<FakeTransport>,
}

/// 2024-05-01 12:00:00 UTC, a Wednesday.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

impl Harness {
    pub fn new(cfg: &ConfigFile) -> Self {
        Self::with_clusters(cfg, ClusterRepository::new())
    }

    pub fn with_clusters(cfg: &ConfigFile, clusters: ClusterRepository) -> Self {
        Self::build(cfg, clusters, Arc::new(MockFileSystem::new()))
    }

    /// Harness whose engine writes action output to `fs`.
    pub fn with_fs(cfg: &ConfigFile, fs: Arc<dyn FileSystem>) -> Self {
        Self::build(cfg, ClusterRepository::new(), fs)
    }

    fn build(cfg: &ConfigFile, clusters: ClusterRepository, fs: Arc<dyn FileSystem>) -> Self {
        let event_loop = Arc::new(ManualEventLoop::new(start_time()));
        let transport = Arc::new(FakeTransport::new());
        let shared: Arc<dyn NodeTransport> = transport.clone();
        let pools = tron::build_node_pools(cfg, shared).expect("node pools");
        let env = tron::build_env(cfg, pools, event_loop.clone())
            .expect("engine env")
            .with_clusters(clusters)
            .with_fs(fs);
        let core = CoreRuntime::from_config(cfg, env).expect("core runtime");
        Self {
            core,
            event_loop,
            transport,
        }
    }

    /// Start every job and service with no stored state.
    pub fn initialize(&mut self) {
        self.initialize_from(RestoredState::default());
    }

    pub fn initialize_from(&mut self, restored: RestoredState) {
        self.core.initialize(restored);
        self.run_due();
    }

    /// Deliver every zero-delay timer, including ones they set in turn.
    pub fn run_due(&mut self) {
        loop {
            let due = self.event_loop.due_now();
            if due.is_empty() {
                break;
            }
            for event in due {
                self.core.step(RuntimeEvent::Timer(event));
            }
        }
    }

    /// Move the clock forward and deliver every timer that came due.
    pub fn advance(&mut self, by: Duration) {
        for event in self.event_loop.advance(by) {
            self.core.step(RuntimeEvent::Timer(event));
        }
        self.run_due();
    }

    pub fn take_submitted(&self) -> Vec<CommandRequest> {
        self.transport.take_submitted()
    }

    /// The single command submitted since the last call.
    pub fn take_one(&self) -> CommandRequest {
        let mut submitted = self.take_submitted();
        assert_eq!(submitted.len(), 1, "expected one submission, got {submitted:?}");
        submitted.remove(0)
    }

    pub fn send(&mut self, request: &CommandRequest, lifecycle: CommandLifecycle) -> CoreStep {
        let step = self.core.step(RuntimeEvent::Command {
            route: request.route.clone(),
            key: request.key.clone(),
            lifecycle,
        });
        self.run_due();
        step
    }

    /// Start, exit with `exit` and close a submitted command.
    pub fn complete(&mut self, request: &CommandRequest, exit: Option<i32>) {
        self.send(request, CommandLifecycle::Started);
        self.send(request, CommandLifecycle::Exited(exit));
        self.send(request, CommandLifecycle::Done);
    }

    pub fn admin(&mut self, command: AdminCommand) -> CoreStep {
        let step = self.core.step(RuntimeEvent::Admin(command));
        self.run_due();
        step
    }
}
