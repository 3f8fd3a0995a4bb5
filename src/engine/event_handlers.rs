// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.
//!
//! Each handler routes one [`RuntimeEvent`](crate::engine::RuntimeEvent) to
//! the job scheduler or service it belongs to and reports what the IO shell
//! should do next.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::engine::env::EngineEnv;
use crate::errors::Result;
use crate::eventloop::TimerEvent;
use crate::job::JobScheduler;
use crate::node::{CommandLifecycle, CommandRoute};
use crate::service::Service;

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreCommand {
    /// Persist whatever changed while handling the event.
    FlushState,
    /// Outcome of an administrative command.
    AdminReply(std::result::Result<String, String>),
    /// Stop the runtime loop.
    RequestExit,
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl CoreStep {
    fn idle() -> Self {
        Self {
            commands: Vec::new(),
            keep_running: true,
        }
    }

    fn flush() -> Self {
        Self {
            commands: vec![CoreCommand::FlushState],
            keep_running: true,
        }
    }
}

/// Deliver a command lifecycle callback to the action run or service
/// instance that submitted it.
pub fn handle_command(
    jobs: &mut BTreeMap<String, JobScheduler>,
    services: &mut BTreeMap<String, Service>,
    env: &EngineEnv,
    route: CommandRoute,
    key: String,
    lifecycle: CommandLifecycle,
) -> CoreStep {
    match route {
        CommandRoute::ActionRun {
            job,
            run_num,
            action,
        } => {
            let Some(scheduler) = jobs.get_mut(&job) else {
                debug!(%job, run_num, %action, "command update for an unknown job");
                return CoreStep::idle();
            };
            if !scheduler.handle_command(run_num, &action, &key, &lifecycle, env) {
                return CoreStep::idle();
            }
        }
        CommandRoute::ServiceTask {
            service,
            instance,
            task,
        } => {
            let Some(svc) = services.get_mut(&service) else {
                debug!(%service, instance, "command update for an unknown service");
                return CoreStep::idle();
            };
            svc.handle_command(instance, task, &key, &lifecycle, env);
        }
    }
    CoreStep::flush()
}

/// React to a timer set through the event loop.
pub fn handle_timer(
    jobs: &mut BTreeMap<String, JobScheduler>,
    services: &mut BTreeMap<String, Service>,
    env: &EngineEnv,
    event: TimerEvent,
) -> CoreStep {
    match event {
        TimerEvent::RunJob {
            job,
            run_num,
            run_queued,
        } => match jobs.get_mut(&job) {
            Some(scheduler) => scheduler.run_job(run_num, run_queued, env),
            None => warn!(%job, run_num, "timer fired for an unknown job"),
        },
        TimerEvent::StopJobRun { job, run_num } => {
            if let Some(scheduler) = jobs.get_mut(&job) {
                scheduler.stop_job_run(run_num, env);
            }
        }
        TimerEvent::SubmitRecovery {
            job,
            run_num,
            action,
        } => {
            if let Some(scheduler) = jobs.get_mut(&job) {
                scheduler.submit_recovery(run_num, &action, env);
            }
        }
        TimerEvent::RepairService { service } => {
            if let Some(svc) = services.get_mut(&service) {
                svc.repair_fired(env);
            }
        }
        TimerEvent::MonitorInstance { service, instance } => {
            if let Some(svc) = services.get_mut(&service) {
                svc.monitor_fired(instance, env);
            }
        }
        TimerEvent::MonitorHangCheck { service, instance } => {
            if let Some(svc) = services.get_mut(&service) {
                svc.hang_check_fired(instance, env);
            }
        }
    }
    CoreStep::flush()
}

/// Wrap the outcome of an administrative command.
pub fn admin_reply(result: Result<String>) -> CoreStep {
    let reply = result.map_err(|err| err.to_string());
    CoreStep {
        commands: vec![CoreCommand::AdminReply(reply), CoreCommand::FlushState],
        keep_running: true,
    }
}

/// Raise the shutdown flag so no new runs start, persist, and stop.
///
/// Running commands are left alone; their action runs come back as
/// UNKNOWN on the next start and go through recovery.
pub fn handle_shutdown(env: &EngineEnv) -> CoreStep {
    info!("shutdown requested");
    env.request_shutdown();
    CoreStep {
        commands: vec![CoreCommand::FlushState, CoreCommand::RequestExit],
        keep_running: false,
    }
}
