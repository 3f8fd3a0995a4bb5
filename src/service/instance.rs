// src/service/instance.rs

//! One supervised process of a service.
//!
//! An instance runs three kinds of command on its node:
//!
//! - start: launches the service command
//! - monitor: `cat <pid_file> | xargs kill -0`, repeated every
//!   `monitor_interval` and guarded by a hang check
//! - stop: `cat <pid_file> | xargs kill -<signal>`
//!
//! Their outcomes drive the instance's state machine.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::action::{ActionCommand, CommandState, StringBufferStore};
use crate::command_context::{CommandContext, ServiceInstanceContext, render};
use crate::engine::env::EngineEnv;
use crate::eventloop::{TimerEvent, UniqueCallback};
use crate::machine::{State, StateMachine, TransitionTable};
use crate::node::{CommandLifecycle, CommandRequest, CommandRoute, Node, ServiceTask};

pub const MIN_HANG_CHECK: Duration = Duration::from_secs(10);
pub const HANG_CHECK_DELAY_RATIO: f64 = 0.9;

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceInstanceState {
    Down,
    Starting,
    Monitoring,
    Up,
    Failed,
    Stopping,
    Unknown,
}

impl State for ServiceInstanceState {
    fn name(&self) -> &'static str {
        match self {
            ServiceInstanceState::Down => "down",
            ServiceInstanceState::Starting => "starting",
            ServiceInstanceState::Monitoring => "monitoring",
            ServiceInstanceState::Up => "up",
            ServiceInstanceState::Failed => "failed",
            ServiceInstanceState::Stopping => "stopping",
            ServiceInstanceState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServiceInstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn instance_table() -> &'static TransitionTable<ServiceInstanceState> {
    static TABLE: OnceLock<TransitionTable<ServiceInstanceState>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use ServiceInstanceState::*;
        TransitionTable::new()
            .with(Down, "start", Starting)
            .with(Down, "monitor", Monitoring)
            .with(Starting, "down", Failed)
            .with(Starting, "monitor", Monitoring)
            .with(Starting, "stop", Stopping)
            .with(Monitoring, "down", Failed)
            .with(Monitoring, "stop", Stopping)
            .with(Monitoring, "up", Up)
            .with(Monitoring, "monitor_fail", Unknown)
            .with(Up, "stop", Stopping)
            .with(Up, "monitor", Monitoring)
            .with(Failed, "stop", Down)
            .with(Failed, "up", Up)
            .with(Stopping, "down", Down)
            .with(Stopping, "stop_fail", Failed)
            .with(Unknown, "monitor", Monitoring)
            .with(Unknown, "stop", Down)
    })
}

/// Persisted form of an instance: enough to find its process again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstanceStateData {
    pub instance_number: u32,
    /// Hostname of the node the instance ran on.
    pub node: String,
}

/// Static settings shared by every instance of a service.
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub service_name: String,
    pub command: String,
    pub pid_file: String,
    pub monitor_interval: Duration,
    pub monitor_retries: Option<u32>,
}

#[derive(Debug)]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_number: u32,
    pub node: Arc<Node>,
    machine: StateMachine<ServiceInstanceState>,
    command: String,
    pid_file: String,
    monitor_retries: Option<u32>,
    failures: Vec<String>,
    monitor_action: Option<ActionCommand>,
    monitor_callback: UniqueCallback,
    hang_check: UniqueCallback,
    start_action: Option<ActionCommand>,
    stop_action: Option<ActionCommand>,
}

impl ServiceInstance {
    pub fn new(
        settings: &InstanceSettings,
        node: Arc<Node>,
        instance_number: u32,
        parent: &CommandContext,
    ) -> Self {
        let id = format!("{}.{instance_number}", settings.service_name);
        let context = CommandContext::chained(
            ServiceInstanceContext {
                instance_number,
                node: node.hostname.clone(),
                name: settings.service_name.clone(),
            },
            parent,
        );
        let render_or_raw = |template: &str| {
            render(template, &context).unwrap_or_else(|err| {
                error!(instance = %id, error = %err, template, "failed rendering service template");
                template.to_string()
            })
        };

        let monitor_event = TimerEvent::MonitorInstance {
            service: settings.service_name.clone(),
            instance: instance_number,
        };
        let hang_event = TimerEvent::MonitorHangCheck {
            service: settings.service_name.clone(),
            instance: instance_number,
        };
        let hang_delay = settings
            .monitor_interval
            .mul_f64(HANG_CHECK_DELAY_RATIO)
            .max(MIN_HANG_CHECK);

        Self {
            service_name: settings.service_name.clone(),
            instance_number,
            command: render_or_raw(&settings.command),
            pid_file: render_or_raw(&settings.pid_file),
            node,
            machine: StateMachine::new(instance_table(), ServiceInstanceState::Down),
            monitor_retries: settings.monitor_retries,
            failures: Vec::new(),
            monitor_action: None,
            monitor_callback: UniqueCallback::new(settings.monitor_interval, monitor_event),
            hang_check: UniqueCallback::new(hang_delay, hang_event),
            start_action: None,
            stop_action: None,
        }
    }

    pub fn id(&self) -> String {
        format!("{}.{}", self.service_name, self.instance_number)
    }

    pub fn state(&self) -> ServiceInstanceState {
        self.machine.state()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid_file(&self) -> &str {
        &self.pid_file
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn state_data(&self) -> ServiceInstanceStateData {
        ServiceInstanceStateData {
            instance_number: self.instance_number,
            node: self.node.hostname.clone(),
        }
    }

    fn transition(&mut self, event: &str) -> bool {
        match self.machine.transition(event) {
            Ok(moved) => moved,
            Err(err) => {
                error!(instance = %self.id(), error = %err, "invalid service instance transition");
                false
            }
        }
    }

    fn route(&self, task: ServiceTask) -> CommandRoute {
        CommandRoute::ServiceTask {
            service: self.service_name.clone(),
            instance: self.instance_number,
            task,
        }
    }

    fn task_name(task: ServiceTask) -> &'static str {
        match task {
            ServiceTask::Monitor => "monitor",
            ServiceTask::Start => "start",
            ServiceTask::Stop => "stop",
        }
    }

    /// Build and submit a task command. On a node error the command's
    /// stderr says why and the flag is false.
    fn submit(&self, task: ServiceTask, command: String) -> (ActionCommand, bool) {
        let mut action = ActionCommand::new(
            format!("{}.{}", self.id(), Self::task_name(task)),
            command,
        );
        let request = CommandRequest {
            key: action.key.clone(),
            route: self.route(task),
            command: action.command.clone(),
        };
        debug!(instance = %self.id(), task = Self::task_name(task), command = %action.command, "running service task");
        match self.node.submit_command(request) {
            Ok(()) => (action, true),
            Err(err) => {
                error!(instance = %self.id(), node = %self.node.name, error = %err, "failed to run service task");
                action.write_stderr(&format!(
                    "Node run failure for {}: {err}",
                    Self::task_name(task)
                ));
                (action, false)
            }
        }
    }

    /// Launch the service process.
    pub fn start(&mut self, env: &EngineEnv) -> bool {
        if !self.transition("start") {
            return false;
        }
        info!(instance = %self.id(), node = %self.node.name, "starting service instance");
        let (action, submitted) = self.submit(ServiceTask::Start, self.command.clone());
        let stderr = action.output().get_stream(StringBufferStore::STDERR);
        self.start_action = Some(action);
        if !submitted {
            self.failures.push(stderr);
            self.start_complete(env);
        }
        submitted
    }

    pub fn stop(&mut self, env: &EngineEnv) -> bool {
        self.perform_stop(SIGTERM, env)
    }

    pub fn kill(&mut self, env: &EngineEnv) -> bool {
        self.perform_stop(SIGKILL, env)
    }

    fn perform_stop(&mut self, signal: i32, env: &EngineEnv) -> bool {
        if self.machine.check("stop").is_none() {
            return false;
        }
        self.submit_stop(signal);
        self.cancel_monitor(env);
        self.transition("stop")
    }

    fn submit_stop(&mut self, signal: i32) {
        let command = format!("cat {} | xargs kill -{signal}", self.pid_file);
        let (action, submitted) = self.submit(ServiceTask::Stop, command);
        let stderr = action.output().get_stream(StringBufferStore::STDERR);
        self.stop_action = Some(action);
        if !submitted {
            warn!(instance = %self.id(), "failed to start stop command");
            self.failures.push(stderr);
            self.transition("stop_fail");
        }
    }

    /// Find a running process again after a restore.
    pub fn restore(&mut self, env: &EngineEnv) {
        self.run_monitor(env);
    }

    /// Arm the next monitor run.
    pub fn queue_monitor(&mut self, env: &EngineEnv) {
        if self.monitor_callback.start(env.event_loop.as_ref()) {
            debug!(instance = %self.id(), "queued monitor");
        }
    }

    pub fn cancel_monitor(&mut self, env: &EngineEnv) {
        self.monitor_callback.cancel(env.event_loop.as_ref());
        self.hang_check.cancel(env.event_loop.as_ref());
    }

    /// The monitor timer fired.
    pub fn monitor_fired(&mut self, env: &EngineEnv) {
        self.monitor_callback.fired();
        self.run_monitor(env);
    }

    fn run_monitor(&mut self, env: &EngineEnv) {
        if self.monitor_action.as_ref().is_some_and(|a| !a.is_done()) {
            warn!(instance = %self.id(), "monitor action already exists");
            return;
        }
        self.transition("monitor");
        let command = format!("cat {} | xargs kill -0", self.pid_file);
        let (action, submitted) = self.submit(ServiceTask::Monitor, command);
        if submitted {
            self.monitor_action = Some(action);
            self.hang_check.start(env.event_loop.as_ref());
        } else {
            let stderr = action.output().get_stream(StringBufferStore::STDERR);
            self.monitor_action = None;
            self.monitor_failed(stderr, env);
        }
    }

    /// The monitor did not answer in time.
    pub fn hang_check_fired(&mut self, env: &EngineEnv) {
        self.hang_check.fired();
        let Some(mut action) = self.monitor_action.take() else {
            return;
        };
        if action.is_done() {
            return;
        }
        warn!(instance = %self.id(), command = %action.command, "monitor is still running");
        self.node.stop(&action.key);
        action.write_stderr("Monitoring failed");
        let stderr = action.output().get_stream(StringBufferStore::STDERR);
        self.monitor_failed(stderr, env);
    }

    fn monitor_failed(&mut self, failure: String, env: &EngineEnv) {
        self.transition("monitor_fail");
        self.failures.push(failure);
        let too_many = self
            .monitor_retries
            .is_some_and(|retries| retries > 0 && (retries as usize) < self.failures.len());
        if too_many {
            info!(instance = %self.id(), failures = self.failures.len(), "too many monitor failures");
            self.cancel_monitor(env);
            self.transition("stop");
        }
    }

    fn start_complete(&mut self, env: &EngineEnv) {
        if self.state() != ServiceInstanceState::Starting {
            self.submit_stop(SIGTERM);
            return;
        }
        info!(instance = %self.id(), "start complete, starting monitor");
        self.queue_monitor(env);
    }

    /// Feed a lifecycle callback for one of this instance's commands.
    /// Returns true if the instance's state changed.
    pub fn handle_command(
        &mut self,
        task: ServiceTask,
        key: &str,
        lifecycle: &CommandLifecycle,
        env: &EngineEnv,
    ) -> bool {
        let before = self.state();
        let now = env.now();
        match task {
            ServiceTask::Monitor => {
                let Some(action) = self.monitor_action.as_mut().filter(|a| a.key == key) else {
                    warn!(instance = %self.id(), key, "ignoring monitor event, action was cleared");
                    return false;
                };
                match action.handle(lifecycle, now) {
                    Some(CommandState::Exiting) => {
                        self.hang_check.cancel(env.event_loop.as_ref());
                        self.monitor_exited(env);
                    }
                    Some(CommandState::Failstart) => {
                        self.hang_check.cancel(env.event_loop.as_ref());
                        self.queue_monitor(env);
                        let stderr = action_stderr(self.monitor_action.as_ref());
                        self.monitor_failed(stderr, env);
                    }
                    _ => {}
                }
            }
            ServiceTask::Start => {
                let id = self.id();
                let Some(action) = self.start_action.as_mut().filter(|a| a.key == key) else {
                    return false;
                };
                match action.handle(lifecycle, now) {
                    Some(CommandState::Exiting) => {
                        if action.is_failed() {
                            let stderr = action.output().get_stream(StringBufferStore::STDERR);
                            self.failures.push(stderr);
                        }
                        self.start_complete(env);
                    }
                    Some(CommandState::Failstart) => {
                        warn!(instance = %id, node = %self.node.name, "failed to start service");
                        let stderr = action.output().get_stream(StringBufferStore::STDERR);
                        self.failures.push(stderr);
                        self.start_complete(env);
                    }
                    _ => {}
                }
            }
            ServiceTask::Stop => {
                let id = self.id();
                let Some(action) = self.stop_action.as_mut().filter(|a| a.key == key) else {
                    return false;
                };
                match action.handle(lifecycle, now) {
                    Some(CommandState::Complete) => {
                        if action.is_failed() {
                            error!(instance = %id, "failed to stop");
                        }
                        self.transition("down");
                    }
                    Some(CommandState::Failstart) => {
                        warn!(instance = %id, "failed to start kill command");
                        let stderr = action.output().get_stream(StringBufferStore::STDERR);
                        self.failures.push(stderr);
                        self.transition("stop_fail");
                    }
                    _ => {}
                }
            }
        }
        self.state() != before
    }

    fn monitor_exited(&mut self, env: &EngineEnv) {
        let Some(action) = self.monitor_action.as_ref() else {
            return;
        };
        debug!(instance = %self.id(), exit_status = ?action.exit_status, "monitor exited");
        if action.is_unknown() {
            let stderr = action.output().get_stream(StringBufferStore::STDERR);
            self.queue_monitor(env);
            self.monitor_failed(stderr, env);
            return;
        }
        if action.is_failed() {
            self.transition("down");
            return;
        }
        self.transition("up");
        self.failures.clear();
        self.queue_monitor(env);
    }
}

fn action_stderr(action: Option<&ActionCommand>) -> String {
    action
        .map(|a| a.output().get_stream(StringBufferStore::STDERR))
        .unwrap_or_default()
}
