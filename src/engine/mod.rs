// src/engine/mod.rs

//! Orchestration engine for tron.
//!
//! This module ties together:
//! - job schedulers and their runs
//! - services and their instances
//! - the runtime event loop that reacts to:
//!   - command lifecycle callbacks from nodes and clusters
//!   - timers
//!   - administrative commands
//!   - shutdown signals
//!
//! The pure core lives in [`core`]; the async/IO shell is implemented in
//! [`runtime`].

use chrono::{DateTime, Utc};

use crate::eventloop::TimerEvent;
use crate::node::{CommandLifecycle, CommandRoute};

/// Operator actions on a single action run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionRunOp {
    Start,
    Success,
    /// Force failure with an optional exit status (1 when absent).
    Fail(Option<i32>),
    Skip,
    Cancel,
    Stop,
    Kill,
    Retry,
    Recover,
}

/// Operator actions on a whole job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRunOp {
    Start,
    Cancel,
    Success,
    Fail,
    Stop,
}

impl JobRunOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunOp::Start => "start",
            JobRunOp::Cancel => "cancel",
            JobRunOp::Success => "succeed",
            JobRunOp::Fail => "fail",
            JobRunOp::Stop => "stop",
        }
    }
}

/// Administrative commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    EnableJob {
        job: String,
    },
    DisableJob {
        job: String,
    },
    /// Build and start a manual run now, or at `run_time`'s logical time.
    StartJob {
        job: String,
        run_time: Option<DateTime<Utc>>,
    },
    JobRun {
        job: String,
        run_num: u64,
        op: JobRunOp,
    },
    ActionRun {
        job: String,
        run_num: u64,
        action: String,
        op: ActionRunOp,
    },
    EnableService {
        service: String,
    },
    DisableService {
        service: String,
    },
}

/// Events flowing into the runtime from transports, timers and operators.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A lifecycle callback for a submitted command or task.
    Command {
        route: CommandRoute,
        key: String,
        lifecycle: CommandLifecycle,
    },
    /// A timer set through the event loop fired.
    Timer(TimerEvent),
    Admin(AdminCommand),
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

/// Notifications published by the engine, consumed by the state watcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineEvent {
    JobChanged { job: String },
    JobRunChanged { job: String, run_num: u64 },
    JobRunRemoved { job: String, run_num: u64 },
    ServiceChanged { service: String },
}

pub mod core;
pub mod env;
pub mod event_handlers;
pub mod runtime;

pub use self::core::CoreRuntime;
pub use env::EngineEnv;
pub use event_handlers::{CoreCommand, CoreStep};
pub use runtime::Runtime;
