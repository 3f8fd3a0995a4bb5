// src/service/mod.rs

//! Long-running services: a fixed number of supervised instances spread
//! over a node pool.
//!
//! A [`Service`] owns its [`ServiceInstanceCollection`] and routes every
//! command callback and timer to the right instance, comparing the
//! instance's state before and after. When
//! the aggregate [`ServiceState`] is degraded or failed, a debounced repair
//! timer clears failed instances and starts replacements.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::model::{ServiceConfig, parse_duration};
use crate::engine::EngineEvent;
use crate::engine::env::EngineEnv;
use crate::errors::{Result, TronError};
use crate::eventloop::{TimerEvent, UniqueCallback};
use crate::node::{CommandLifecycle, ServiceTask};

pub mod collection;
pub mod instance;

pub use collection::ServiceInstanceCollection;
pub use instance::{
    InstanceSettings, ServiceInstance, ServiceInstanceState, ServiceInstanceStateData,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceState {
    Disabled,
    Starting,
    Up,
    Degraded,
    Failed,
    Stopping,
    Unknown,
}

impl ServiceState {
    pub fn is_failure(&self) -> bool {
        matches!(self, ServiceState::Degraded | ServiceState::Failed)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Disabled => "DISABLED",
            ServiceState::Starting => "STARTING",
            ServiceState::Up => "UP",
            ServiceState::Degraded => "DEGRADED",
            ServiceState::Failed => "FAILED",
            ServiceState::Stopping => "STOPPING",
            ServiceState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStateData {
    pub enabled: bool,
    #[serde(default)]
    pub instances: Vec<ServiceInstanceStateData>,
}

#[derive(Debug)]
pub struct Service {
    pub name: String,
    enabled: bool,
    instances: ServiceInstanceCollection,
    /// `None` when automatic repair is off.
    repair_callback: Option<UniqueCallback>,
}

impl Service {
    pub fn from_config(name: &str, config: &ServiceConfig, env: &EngineEnv) -> Result<Self> {
        let node_pool = env.node_pools.get_pool(&config.node).ok_or_else(|| {
            TronError::ConfigError(format!("service '{name}' uses unknown node '{}'", config.node))
        })?;
        let monitor_interval = parse_duration(&config.monitor_interval)
            .map_err(|e| TronError::ConfigError(format!("service '{name}': {e}")))?;
        let restart_interval = match config.restart_interval.as_deref() {
            Some(value) => parse_duration(value)
                .map_err(|e| TronError::ConfigError(format!("service '{name}': {e}")))?,
            None => Duration::ZERO,
        };

        let settings = InstanceSettings {
            service_name: name.to_string(),
            command: config.command.clone(),
            pid_file: config.pid_file.clone(),
            monitor_interval,
            monitor_retries: config.monitor_retries,
        };
        let repair_callback = (!restart_interval.is_zero()).then(|| {
            UniqueCallback::new(
                restart_interval,
                TimerEvent::RepairService {
                    service: name.to_string(),
                },
            )
        });

        Ok(Self {
            name: name.to_string(),
            enabled: false,
            instances: ServiceInstanceCollection::new(
                settings,
                config.count,
                node_pool,
                env.context.clone(),
            ),
            repair_callback,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn instances(&self) -> &ServiceInstanceCollection {
        &self.instances
    }

    pub fn state(&self) -> ServiceState {
        let instances = &self.instances;
        if !self.enabled {
            if instances.is_empty() {
                return ServiceState::Disabled;
            }
            if instances.all(ServiceInstanceState::Stopping) {
                return ServiceState::Stopping;
            }
            return ServiceState::Unknown;
        }
        if instances.all(ServiceInstanceState::Up) {
            ServiceState::Up
        } else if instances.is_starting() {
            ServiceState::Starting
        } else if instances.all(ServiceInstanceState::Failed) {
            ServiceState::Failed
        } else {
            ServiceState::Degraded
        }
    }

    pub fn state_data(&self) -> ServiceStateData {
        ServiceStateData {
            enabled: self.enabled,
            instances: self.instances.state_data(),
        }
    }

    fn changed(&self, env: &EngineEnv) {
        env.notify(EngineEvent::ServiceChanged {
            service: self.name.clone(),
        });
    }

    pub fn enable(&mut self, env: &EngineEnv) {
        self.enabled = true;
        info!(service = %self.name, "enabled");
        self.repair(env);
    }

    pub fn disable(&mut self, env: &EngineEnv) {
        self.enabled = false;
        self.instances.stop(env);
        if let Some(callback) = self.repair_callback.as_mut() {
            callback.cancel(env.event_loop.as_ref());
        }
        info!(service = %self.name, "disabled");
        self.changed(env);
    }

    /// Replace failed instances and start anything missing.
    pub fn repair(&mut self, env: &EngineEnv) {
        info!(service = %self.name, "repairing");
        self.instances.clear_failed(env);
        self.instances.restore(env);
        self.instances.create_missing();
        self.changed(env);
        self.instances.start(env);
    }

    pub fn repair_fired(&mut self, env: &EngineEnv) {
        if let Some(callback) = self.repair_callback.as_mut() {
            callback.fired();
        }
        if !self.enabled {
            return;
        }
        self.repair(env);
    }

    /// React to an instance moving to `state`.
    fn instance_changed(&mut self, state: ServiceInstanceState, env: &EngineEnv) {
        if state == ServiceInstanceState::Down {
            self.instances.clear_down(env);
        }
        self.changed(env);

        let service_state = self.state();
        match state {
            ServiceInstanceState::Failed | ServiceInstanceState::Up if service_state.is_failure() => {
                error!(service = %self.name, state = %service_state, "service is unhealthy");
            }
            ServiceInstanceState::Failed | ServiceInstanceState::Up if service_state == ServiceState::Up => {
                info!(service = %self.name, "service is up");
            }
            _ => {}
        }
        if service_state.is_failure() {
            if let Some(callback) = self.repair_callback.as_mut() {
                if callback.start(env.event_loop.as_ref()) {
                    info!(service = %self.name, "starting service repair");
                }
            }
        }
    }

    /// Run `f` against one instance and react if its state changed.
    fn with_instance<F>(&mut self, instance_number: u32, env: &EngineEnv, f: F)
    where
        F: FnOnce(&mut ServiceInstance, &EngineEnv),
    {
        let Some(instance) = self.instances.get_by_number_mut(instance_number) else {
            warn!(service = %self.name, instance = instance_number, "event for unknown service instance");
            return;
        };
        let before = instance.state();
        f(instance, env);
        let after = instance.state();
        if after != before {
            self.instance_changed(after, env);
        }
    }

    pub fn handle_command(
        &mut self,
        instance_number: u32,
        task: ServiceTask,
        key: &str,
        lifecycle: &CommandLifecycle,
        env: &EngineEnv,
    ) {
        self.with_instance(instance_number, env, |inst, env| {
            inst.handle_command(task, key, lifecycle, env);
        });
    }

    pub fn monitor_fired(&mut self, instance_number: u32, env: &EngineEnv) {
        self.with_instance(instance_number, env, |inst, env| inst.monitor_fired(env));
    }

    pub fn hang_check_fired(&mut self, instance_number: u32, env: &EngineEnv) {
        self.with_instance(instance_number, env, |inst, env| inst.hang_check_fired(env));
    }

    /// Rebuild instances from saved state, then enable (which monitors and
    /// repairs them) or disable.
    pub fn restore_state(&mut self, data: &ServiceStateData, env: &EngineEnv) {
        self.instances.restore_state(&data.instances);
        if data.enabled {
            self.enable(env);
        } else {
            self.disable(env);
        }
        info!(service = %self.name, instances = self.instances.len(), "restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chrono::{TimeZone, Utc};

    use crate::eventloop::ManualEventLoop;
    use crate::node::{CommandRequest, CommandRoute, Node, NodeError, NodePoolStore, NodeTransport};

    #[derive(Debug, Default)]
    struct Recorder {
        submitted: Mutex<Vec<CommandRequest>>,
        stopped: Mutex<Vec<String>>,
    }

    impl NodeTransport for Recorder {
        fn submit(&self, _node: &Node, request: CommandRequest) -> std::result::Result<(), NodeError> {
            self.submitted.lock().unwrap().push(request);
            Ok(())
        }

        fn stop(&self, _node: &Node, key: &str) {
            self.stopped.lock().unwrap().push(key.to_string());
        }
    }

    impl Recorder {
        fn last(&self, instance: u32, task: ServiceTask) -> CommandRequest {
            self.submitted
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|r| {
                    r.route
                        == CommandRoute::ServiceTask {
                            service: "web".into(),
                            instance,
                            task,
                        }
                })
                .cloned()
                .unwrap()
        }
    }

    fn config(count: u32) -> ServiceConfig {
        ServiceConfig {
            node: "pool".into(),
            command: "serve --port 80%(instance_number)s".into(),
            pid_file: "/var/run/%(name)s-%(instance_number)s.pid".into(),
            count,
            monitor_interval: "20s".into(),
            restart_interval: Some("1m".into()),
            monitor_retries: Some(2),
        }
    }

    fn setup(count: u32) -> (EngineEnv, Arc<ManualEventLoop>, Arc<Recorder>, Service) {
        let recorder = Arc::new(Recorder::default());
        let mut pools = NodePoolStore::new();
        let a = pools.add_node(Node::new("a", "a.example", None, 22, recorder.clone()));
        let b = pools.add_node(Node::new("b", "b.example", None, 22, recorder.clone()));
        pools.add_pool(crate::node::NodePool::new("pool", vec![a, b]));
        let event_loop = Arc::new(ManualEventLoop::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let env = EngineEnv::new(event_loop.clone(), pools);
        let service = Service::from_config("web", &config(count), &env).unwrap();
        (env, event_loop, recorder, service)
    }

    fn finish(service: &mut Service, env: &EngineEnv, req: &CommandRequest, status: i32) {
        let CommandRoute::ServiceTask { instance, task, .. } = req.route.clone() else {
            panic!("not a service task");
        };
        service.handle_command(instance, task, &req.key, &CommandLifecycle::Started, env);
        service.handle_command(instance, task, &req.key, &CommandLifecycle::Exited(Some(status)), env);
        service.handle_command(instance, task, &req.key, &CommandLifecycle::Done, env);
    }

    /// Enable, let the start commands succeed and the first monitor pass.
    fn bring_up(service: &mut Service, env: &EngineEnv, event_loop: &ManualEventLoop, recorder: &Recorder) {
        service.enable(env);
        for n in 0..service.instances().count() {
            finish(service, env, &recorder.last(n, ServiceTask::Start), 0);
        }
        for event in event_loop.advance(Duration::from_secs(20)) {
            if let TimerEvent::MonitorInstance { instance, .. } = event {
                service.monitor_fired(instance, env);
            }
        }
        for n in 0..service.instances().count() {
            finish(service, env, &recorder.last(n, ServiceTask::Monitor), 0);
        }
    }

    #[test]
    fn disabled_service_without_instances() {
        let (_env, _, _, service) = setup(2);
        assert_eq!(service.state(), ServiceState::Disabled);
        assert_eq!(
            service.state_data(),
            ServiceStateData { enabled: false, instances: vec![] }
        );
    }

    #[test]
    fn enable_starts_every_instance_round_robin() {
        let (env, _, recorder, mut service) = setup(2);
        service.enable(&env);
        assert_eq!(service.state(), ServiceState::Starting);

        let first = recorder.last(0, ServiceTask::Start);
        assert_eq!(first.command, "serve --port 800");
        let nodes: Vec<String> = service.state_data().instances.into_iter().map(|i| i.node).collect();
        assert_eq!(nodes, vec!["a.example", "b.example"]);
    }

    #[test]
    fn monitor_success_brings_service_up() {
        let (env, event_loop, recorder, mut service) = setup(2);
        bring_up(&mut service, &env, &event_loop, &recorder);
        assert_eq!(service.state(), ServiceState::Up);

        let monitor = recorder.last(1, ServiceTask::Monitor);
        assert_eq!(monitor.command, "cat /var/run/web-1.pid | xargs kill -0");
    }

    #[test]
    fn dead_process_degrades_and_schedules_repair() {
        let (env, event_loop, recorder, mut service) = setup(2);
        bring_up(&mut service, &env, &event_loop, &recorder);

        for event in event_loop.advance(Duration::from_secs(20)) {
            if let TimerEvent::MonitorInstance { instance, .. } = event {
                service.monitor_fired(instance, &env);
            }
        }
        finish(&mut service, &env, &recorder.last(0, ServiceTask::Monitor), 1);
        assert_eq!(
            service.instances().get_by_number(0).map(|i| i.state()),
            Some(ServiceInstanceState::Failed)
        );
        assert_eq!(service.state(), ServiceState::Degraded);
        assert!(event_loop.pending().iter().any(|(_, e)| matches!(
            e,
            TimerEvent::RepairService { service } if service == "web"
        )));

        service.repair_fired(&env);
        assert_eq!(service.instances().len(), 2);
        assert_eq!(
            service.instances().get_by_number(0).map(|i| i.state()),
            Some(ServiceInstanceState::Starting)
        );
    }

    #[test]
    fn hung_monitor_is_stopped_and_marked_unknown() {
        let (env, event_loop, recorder, mut service) = setup(1);
        bring_up(&mut service, &env, &event_loop, &recorder);

        for event in event_loop.advance(Duration::from_secs(20)) {
            if let TimerEvent::MonitorInstance { instance, .. } = event {
                service.monitor_fired(instance, &env);
            }
        }
        let hung = recorder.last(0, ServiceTask::Monitor);
        for event in event_loop.advance(Duration::from_secs(18)) {
            if let TimerEvent::MonitorHangCheck { instance, .. } = event {
                service.hang_check_fired(instance, &env);
            }
        }
        assert_eq!(recorder.stopped.lock().unwrap().clone(), vec![hung.key.clone()]);
        let instance = service.instances().get_by_number(0).unwrap();
        assert_eq!(instance.state(), ServiceInstanceState::Unknown);
        assert_eq!(instance.failures(), ["Monitoring failed".to_string()]);

        // A late answer from the abandoned monitor is ignored.
        finish(&mut service, &env, &hung, 0);
        assert_eq!(
            service.instances().get_by_number(0).map(|i| i.state()),
            Some(ServiceInstanceState::Unknown)
        );
    }

    #[test]
    fn disable_stops_instances_and_cancels_repair() {
        let (env, event_loop, recorder, mut service) = setup(2);
        bring_up(&mut service, &env, &event_loop, &recorder);

        service.disable(&env);
        assert_eq!(service.state(), ServiceState::Stopping);
        let stop = recorder.last(0, ServiceTask::Stop);
        assert_eq!(stop.command, "cat /var/run/web-0.pid | xargs kill -15");

        finish(&mut service, &env, &stop, 0);
        finish(&mut service, &env, &recorder.last(1, ServiceTask::Stop), 0);
        assert!(service.instances().is_empty());
        assert_eq!(service.state(), ServiceState::Disabled);
        assert!(event_loop.pending().is_empty());
    }

    #[test]
    fn restore_reattaches_by_hostname_and_monitors() {
        let (env, _, recorder, mut service) = setup(2);
        let data = ServiceStateData {
            enabled: true,
            instances: vec![ServiceInstanceStateData {
                instance_number: 1,
                node: "a.example".into(),
            }],
        };
        service.restore_state(&data, &env);

        let restored = service.instances().get_by_number(1).unwrap();
        assert_eq!(restored.node.name, "a");
        assert_eq!(restored.state(), ServiceInstanceState::Monitoring);
        assert_eq!(service.instances().len(), 2);
        assert_eq!(
            recorder.last(0, ServiceTask::Start).command,
            "serve --port 800"
        );
    }
}
