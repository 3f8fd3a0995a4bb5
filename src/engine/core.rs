// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! [`CoreRuntime`] owns every job scheduler and service together with the
//! [`EngineEnv`] they share. It consumes [`RuntimeEvent`]s one at a time and
//! returns a [`CoreStep`] describing what the IO shell should do next.
//!
//! Nothing in here awaits. Timers and command submissions go through the
//! injected event loop and node transports, so the core can be driven
//! step by step in tests with a `ManualEventLoop` and a fake transport.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::model::ConfigFile;
use crate::engine::env::EngineEnv;
use crate::engine::event_handlers::{
    CoreStep, admin_reply, handle_command, handle_shutdown, handle_timer,
};
use crate::engine::{ActionRunOp, AdminCommand, JobRunOp, RuntimeEvent};
use crate::errors::{Result, TronError};
use crate::job::{Job, JobRun, JobRunStateData, JobScheduler, JobStateData};
use crate::serialize::{RestoredState, StateSource};
use crate::service::{Service, ServiceStateData};

#[derive(Debug)]
pub struct CoreRuntime {
    jobs: BTreeMap<String, JobScheduler>,
    services: BTreeMap<String, Service>,
    env: EngineEnv,
}

fn job_mut<'a>(
    jobs: &'a mut BTreeMap<String, JobScheduler>,
    name: &str,
) -> Result<&'a mut JobScheduler> {
    jobs.get_mut(name)
        .ok_or_else(|| TronError::JobNotFound(name.to_string()))
}

fn service_mut<'a>(
    services: &'a mut BTreeMap<String, Service>,
    name: &str,
) -> Result<&'a mut Service> {
    services
        .get_mut(name)
        .ok_or_else(|| TronError::ServiceNotFound(name.to_string()))
}

impl CoreRuntime {
    pub fn new(env: EngineEnv) -> Self {
        Self {
            jobs: BTreeMap::new(),
            services: BTreeMap::new(),
            env,
        }
    }

    /// Build every job and service named in a validated config.
    pub fn from_config(config: &ConfigFile, env: EngineEnv) -> Result<Self> {
        let mut core = Self::new(env);
        let output_dir = config.config.output_stream_dir.as_ref();
        for (name, job_config) in &config.job {
            let job = Job::from_config(name, job_config, output_dir, &core.env)?;
            core.add_job(JobScheduler::new(job));
        }
        for (name, service_config) in &config.service {
            let service = Service::from_config(name, service_config, &core.env)?;
            core.add_service(service);
        }
        info!(
            jobs = core.jobs.len(),
            services = core.services.len(),
            "core runtime built"
        );
        Ok(core)
    }

    pub fn add_job(&mut self, scheduler: JobScheduler) {
        self.jobs.insert(scheduler.name().to_string(), scheduler);
    }

    pub fn add_service(&mut self, service: Service) {
        self.services.insert(service.name.clone(), service);
    }

    pub fn env(&self) -> &EngineEnv {
        &self.env
    }

    pub fn job(&self, name: &str) -> Option<&JobScheduler> {
        self.jobs.get(name)
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Bring every job and service to life, from stored state where there
    /// is some.
    ///
    /// Jobs without stored state get their first run scheduled; services
    /// without stored state are enabled.
    pub fn initialize(&mut self, restored: RestoredState) {
        let no_runs = HashMap::new();
        for (name, scheduler) in self.jobs.iter_mut() {
            match restored.jobs.get(name) {
                Some(state) => {
                    let runs = restored.job_runs.get(name).unwrap_or(&no_runs);
                    scheduler.restore_state(state, runs, &self.env);
                }
                None => scheduler.schedule(&self.env),
            }
        }
        for (name, service) in self.services.iter_mut() {
            match restored.services.get(name) {
                Some(data) => service.restore_state(data, &self.env),
                None => service.enable(&self.env),
            }
        }
    }

    /// Handle a single runtime event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        match event {
            RuntimeEvent::Command {
                route,
                key,
                lifecycle,
            } => handle_command(
                &mut self.jobs,
                &mut self.services,
                &self.env,
                route,
                key,
                lifecycle,
            ),
            RuntimeEvent::Timer(timer) => {
                handle_timer(&mut self.jobs, &mut self.services, &self.env, timer)
            }
            RuntimeEvent::Admin(command) => admin_reply(self.admin(command)),
            RuntimeEvent::ShutdownRequested => handle_shutdown(&self.env),
        }
    }

    fn admin(&mut self, command: AdminCommand) -> Result<String> {
        match command {
            AdminCommand::EnableJob { job } => self.enable_job(&job),
            AdminCommand::DisableJob { job } => self.disable_job(&job),
            AdminCommand::StartJob { job, run_time } => self.manual_start(&job, run_time),
            AdminCommand::JobRun { job, run_num, op } => self.job_run_op(&job, run_num, op),
            AdminCommand::ActionRun {
                job,
                run_num,
                action,
                op,
            } => self.action_run_op(&job, run_num, &action, op),
            AdminCommand::EnableService { service } => self.enable_service(&service),
            AdminCommand::DisableService { service } => self.disable_service(&service),
        }
    }

    pub fn enable_job(&mut self, name: &str) -> Result<String> {
        job_mut(&mut self.jobs, name)?.enable(&self.env);
        Ok(format!("{name} is enabled"))
    }

    pub fn disable_job(&mut self, name: &str) -> Result<String> {
        job_mut(&mut self.jobs, name)?.disable(&self.env);
        Ok(format!("{name} is disabled"))
    }

    /// Build and start a run now (or for `run_time`), regardless of the
    /// schedule.
    pub fn manual_start(&mut self, name: &str, run_time: Option<DateTime<Utc>>) -> Result<String> {
        let run_nums = job_mut(&mut self.jobs, name)?.manual_start(run_time, &self.env);
        let ids: Vec<String> = run_nums.iter().map(|n| format!("{name}.{n}")).collect();
        Ok(format!("Created {}", ids.join(", ")))
    }

    pub fn job_run_op(&mut self, name: &str, run_num: u64, op: JobRunOp) -> Result<String> {
        job_mut(&mut self.jobs, name)?.job_run_op(run_num, op, &self.env)
    }

    pub fn action_run_op(
        &mut self,
        name: &str,
        run_num: u64,
        action: &str,
        op: ActionRunOp,
    ) -> Result<String> {
        job_mut(&mut self.jobs, name)?.action_op(run_num, action, op, &self.env)
    }

    pub fn enable_service(&mut self, name: &str) -> Result<String> {
        service_mut(&mut self.services, name)?.enable(&self.env);
        Ok(format!("{name} is enabled"))
    }

    pub fn disable_service(&mut self, name: &str) -> Result<String> {
        service_mut(&mut self.services, name)?.disable(&self.env);
        Ok(format!("{name} is disabled"))
    }
}

impl StateSource for CoreRuntime {
    fn job_state(&self, job: &str) -> Option<JobStateData> {
        self.jobs.get(job).map(JobScheduler::state_data)
    }

    fn job_run_state(&self, job: &str, run_num: u64) -> Option<JobRunStateData> {
        self.jobs
            .get(job)?
            .job()
            .runs
            .get(run_num)
            .map(JobRun::state_data)
    }

    fn service_state(&self, service: &str) -> Option<ServiceStateData> {
        self.services.get(service).map(Service::state_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::TimeZone;

    use crate::actionrun::ActionRunState;
    use crate::config::load_from_str;
    use crate::engine::event_handlers::CoreCommand;
    use crate::eventloop::{ManualEventLoop, TimerEvent};
    use crate::job::JobStatus;
    use crate::node::{
        CommandLifecycle, CommandRequest, Node, NodeError, NodePoolStore, NodeTransport,
    };
    use crate::service::ServiceState;

    #[derive(Debug, Default)]
    struct Recorder {
        submitted: Mutex<Vec<CommandRequest>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<CommandRequest> {
            std::mem::take(&mut *self.submitted.lock().unwrap())
        }
    }

    impl NodeTransport for Recorder {
        fn submit(&self, _node: &Node, request: CommandRequest) -> std::result::Result<(), NodeError> {
            self.submitted.lock().unwrap().push(request);
            Ok(())
        }

        fn stop(&self, _node: &Node, _key: &str) {}
    }

    const CONFIG: &str = r#"
        [node.box]
        hostname = "localhost"

        [job.etl]
        node = "box"
        schedule = "interval 1h"

        [job.etl.action.fetch]
        command = "fetch"

        [job.etl.action.load]
        command = "load"
        requires = ["fetch"]

        [service.web]
        node = "box"
        command = "serve"
        pid_file = "/tmp/web.pid"
        count = 1
    "#;

    fn build() -> (CoreRuntime, Arc<ManualEventLoop>, Arc<Recorder>) {
        let config = ConfigFile::try_from(load_from_str(CONFIG).unwrap()).unwrap();
        let event_loop = Arc::new(ManualEventLoop::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let transport = Arc::new(Recorder::default());
        let mut pools = NodePoolStore::new();
        pools.add_node(Node::new("box", "localhost", None, 22, transport.clone()));
        let env = EngineEnv::new(event_loop.clone(), pools);
        let core = CoreRuntime::from_config(&config, env).unwrap();
        (core, event_loop, transport)
    }

    fn deliver(
        core: &mut CoreRuntime,
        request: &CommandRequest,
        lifecycle: CommandLifecycle,
    ) -> CoreStep {
        core.step(RuntimeEvent::Command {
            route: request.route.clone(),
            key: request.key.clone(),
            lifecycle,
        })
    }

    /// Start, exit and close `request`, returning the step for the exit.
    fn finish(core: &mut CoreRuntime, request: &CommandRequest, status: i32) -> CoreStep {
        deliver(core, request, CommandLifecycle::Started);
        let exited = deliver(core, request, CommandLifecycle::Exited(Some(status)));
        let done = deliver(core, request, CommandLifecycle::Done);
        // Done changes nothing once the exit was seen.
        assert!(done.commands.is_empty());
        exited
    }

    #[test]
    fn scheduled_run_executes_actions_in_dependency_order() {
        let (mut core, event_loop, transport) = build();
        core.initialize(RestoredState::default());
        // The service monitor probe is not part of this test.
        core.disable_service("web").unwrap();
        transport.take();

        let due = event_loop.advance(Duration::from_secs(3600));
        assert_eq!(
            due,
            vec![TimerEvent::RunJob {
                job: "etl".into(),
                run_num: 0,
                run_queued: false,
            }]
        );
        for event in due {
            core.step(RuntimeEvent::Timer(event));
        }

        let submitted = transport.take();
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].key.starts_with("etl.0.fetch@"));
        assert_eq!(core.job("etl").unwrap().status(), JobStatus::Running);

        let step = deliver(&mut core, &submitted[0], CommandLifecycle::Started);
        assert_eq!(step.commands, vec![CoreCommand::FlushState]);
        let run = core.job("etl").unwrap().job().runs.get(0).unwrap();
        let fetch = run.action_runs().get("fetch").unwrap();
        assert_eq!(fetch.state(), ActionRunState::Running);
        let step = deliver(&mut core, &submitted[0], CommandLifecycle::Exited(Some(0)));
        assert_eq!(step.commands, vec![CoreCommand::FlushState]);
        let step = deliver(&mut core, &submitted[0], CommandLifecycle::Done);
        assert!(step.commands.is_empty());
        let submitted = transport.take();
        assert!(submitted[0].key.starts_with("etl.0.load@"));

        finish(&mut core, &submitted[0], 0);
        let run = core.job_run_state("etl", 0).unwrap();
        assert_eq!(run.run_num, 0);
        let state = core.job("etl").unwrap().job().runs.get(0).unwrap().state();
        assert_eq!(state, ActionRunState::Succeeded);
        // The next run is built once this one is done.
        assert_eq!(core.job_state("etl").unwrap().run_nums, vec![1, 0]);
    }

    #[test]
    fn admin_commands_reply_and_reject_unknown_names() {
        let (mut core, _event_loop, _transport) = build();
        core.initialize(RestoredState::default());

        let step = core.step(RuntimeEvent::Admin(AdminCommand::DisableJob {
            job: "etl".into(),
        }));
        assert_eq!(
            step.commands[0],
            CoreCommand::AdminReply(Ok("etl is disabled".into()))
        );
        assert!(!core.job_state("etl").unwrap().enabled);

        let step = core.step(RuntimeEvent::Admin(AdminCommand::EnableService {
            service: "nope".into(),
        }));
        assert_eq!(
            step.commands[0],
            CoreCommand::AdminReply(Err("Service not found: nope".into()))
        );
        assert!(step.keep_running);
    }

    #[test]
    fn manual_start_submits_immediately() {
        let (mut core, _event_loop, transport) = build();
        core.initialize(RestoredState::default());
        core.disable_service("web").unwrap();
        transport.take();

        let message = core.manual_start("etl", None).unwrap();
        assert_eq!(message, "Created etl.1");
        let submitted = transport.take();
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].key.starts_with("etl.1.fetch@"));
    }

    #[test]
    fn services_without_stored_state_are_enabled() {
        let (mut core, _event_loop, transport) = build();
        core.initialize(RestoredState::default());
        assert_eq!(core.service("web").unwrap().state(), ServiceState::Starting);
        let submitted = transport.take();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].command, "serve");
    }

    #[test]
    fn shutdown_stops_the_loop_and_blocks_new_runs() {
        let (mut core, event_loop, transport) = build();
        core.initialize(RestoredState::default());
        core.disable_service("web").unwrap();
        transport.take();

        let step = core.step(RuntimeEvent::ShutdownRequested);
        assert!(!step.keep_running);
        assert_eq!(
            step.commands,
            vec![CoreCommand::FlushState, CoreCommand::RequestExit]
        );
        assert!(core.env().is_shutdown());

        for event in event_loop.advance(Duration::from_secs(3600)) {
            core.step(RuntimeEvent::Timer(event));
        }
        assert!(transport.take().is_empty());
    }
}
