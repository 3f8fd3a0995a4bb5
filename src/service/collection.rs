// src/service/collection.rs

use std::sync::Arc;

use tracing::info;

use crate::command_context::CommandContext;
use crate::engine::env::EngineEnv;
use crate::node::{Node, NodePool};
use crate::service::instance::{
    InstanceSettings, ServiceInstance, ServiceInstanceState, ServiceInstanceStateData,
};

/// The instances of one service, kept sorted by instance number.
#[derive(Debug)]
pub struct ServiceInstanceCollection {
    settings: InstanceSettings,
    count: u32,
    node_pool: Arc<NodePool>,
    context: CommandContext,
    instances: Vec<ServiceInstance>,
}

impl ServiceInstanceCollection {
    pub fn new(
        settings: InstanceSettings,
        count: u32,
        node_pool: Arc<NodePool>,
        context: CommandContext,
    ) -> Self {
        Self {
            settings,
            count,
            node_pool,
            context,
            instances: Vec::new(),
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceInstance> {
        self.instances.iter()
    }

    pub fn get_by_number(&self, instance_number: u32) -> Option<&ServiceInstance> {
        self.instances
            .iter()
            .find(|inst| inst.instance_number == instance_number)
    }

    pub fn get_by_number_mut(&mut self, instance_number: u32) -> Option<&mut ServiceInstance> {
        self.instances
            .iter_mut()
            .find(|inst| inst.instance_number == instance_number)
    }

    /// How many instances are needed to reach the configured count.
    pub fn missing(&self) -> usize {
        (self.count as usize).saturating_sub(self.instances.len())
    }

    pub fn next_instance_number(&self) -> Option<u32> {
        (0..self.count).find(|num| self.get_by_number(*num).is_none())
    }

    pub fn clear_failed(&mut self, env: &EngineEnv) {
        self.clear(ServiceInstanceState::Failed, env);
    }

    pub fn clear_down(&mut self, env: &EngineEnv) {
        self.clear(ServiceInstanceState::Down, env);
    }

    fn clear(&mut self, state: ServiceInstanceState, env: &EngineEnv) {
        info!(service = %self.settings.service_name, %state, "clearing instances");
        self.instances.retain_mut(|inst| {
            if inst.state() != state {
                return true;
            }
            inst.cancel_monitor(env);
            false
        });
    }

    fn build(&self, node: Arc<Node>, number: u32) -> ServiceInstance {
        ServiceInstance::new(&self.settings, node, number, &self.context)
    }

    fn add(&mut self, instance: ServiceInstance) {
        info!(service = %self.settings.service_name, instance = %instance.id(), node = %instance.node.name, "adding instance");
        self.instances.push(instance);
        self.instances.sort_by_key(|inst| inst.instance_number);
    }

    /// Build instances until the configured count is reached. Returns the
    /// new instance numbers.
    pub fn create_missing(&mut self) -> Vec<u32> {
        let mut created = Vec::new();
        for _ in 0..self.missing() {
            let (Some(number), Some(node)) = (self.next_instance_number(), self.node_pool.next())
            else {
                break;
            };
            self.add(self.build(node, number));
            created.push(number);
        }
        created
    }

    /// Rebuild instances from saved state. A saved node that is no longer
    /// in the pool is replaced by the next node.
    pub fn restore_state(&mut self, data: &[ServiceInstanceStateData]) {
        for item in data {
            if self.get_by_number(item.instance_number).is_some() {
                continue;
            }
            let node = self
                .node_pool
                .get_by_hostname(&item.node)
                .or_else(|| self.node_pool.next());
            if let Some(node) = node {
                self.add(self.build(node, item.instance_number));
            }
        }
    }

    pub fn state_data(&self) -> Vec<ServiceInstanceStateData> {
        self.instances.iter().map(ServiceInstance::state_data).collect()
    }

    /// True if there are exactly `count` instances and all are in `state`.
    pub fn all(&self, state: ServiceInstanceState) -> bool {
        self.instances.len() == self.count as usize && self.all_states_match(&[state])
    }

    pub fn is_starting(&self) -> bool {
        self.all_states_match(&[
            ServiceInstanceState::Starting,
            ServiceInstanceState::Monitoring,
            ServiceInstanceState::Up,
        ])
    }

    pub fn is_up(&self) -> bool {
        self.all_states_match(&[ServiceInstanceState::Monitoring, ServiceInstanceState::Up])
    }

    fn all_states_match(&self, states: &[ServiceInstanceState]) -> bool {
        self.instances
            .iter()
            .all(|inst| states.contains(&inst.state()))
    }

    pub fn start(&mut self, env: &EngineEnv) {
        for inst in &mut self.instances {
            inst.start(env);
        }
    }

    pub fn stop(&mut self, env: &EngineEnv) {
        for inst in &mut self.instances {
            inst.stop(env);
        }
    }

    pub fn kill(&mut self, env: &EngineEnv) {
        for inst in &mut self.instances {
            inst.kill(env);
        }
    }

    pub fn restore(&mut self, env: &EngineEnv) {
        for inst in &mut self.instances {
            inst.restore(env);
        }
    }
}
