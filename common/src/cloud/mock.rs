//! In-process cloud-control double. Drives the scenario tests and stands in
//! for the provider adapter in local deployments.
//
// TODO: drop once the provider adapter crate is wired into the binaries.

use super::{
    CloudControl, CloudError, GroupCapacity, GroupMember, HealthChecks, InstanceDescription,
    InstanceState, LifecycleState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

#[derive(Debug, Clone)]
struct MockInstance {
    state: InstanceState,
    private_ip: Option<String>,
    health: HealthChecks,
    tags: HashMap<String, String>,
    lifecycle_state: LifecycleState,
    group: String,
}

#[derive(Debug, Default)]
struct MockState {
    instances: HashMap<String, MockInstance>,
    groups: HashMap<String, GroupCapacity>,
    started: Vec<String>,
    stopped: Vec<String>,
}

/// A cloud whose instances and groups live in process memory.
#[derive(Clone, Default)]
pub struct MockCloud {
    state: Arc<Mutex<MockState>>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scaling group.
    pub fn with_group(self, name: &str, min: u32, max: u32, desired: u32) -> Self {
        self.state
            .lock()
            .groups
            .insert(name.to_string(), GroupCapacity { min, max, desired });
        self
    }

    /// Register an instance as a member of the given group.
    pub fn add_instance(&self, group: &str, instance_id: &str, state: InstanceState, ip: &str) {
        let health = if state.running() {
            HealthChecks::passing()
        } else {
            HealthChecks::initializing()
        };
        self.state.lock().instances.insert(
            instance_id.to_string(),
            MockInstance {
                state,
                private_ip: Some(ip.to_string()),
                health,
                tags: HashMap::new(),
                lifecycle_state: LifecycleState::InService,
                group: group.to_string(),
            },
        );
    }

    /// Override the reported machine state.
    pub fn set_state(&self, instance_id: &str, state: InstanceState) {
        if let Some(instance) = self.state.lock().instances.get_mut(instance_id) {
            instance.state = state;
            if state.running() {
                instance.health = HealthChecks::passing();
            }
        }
    }

    /// Override the reported health checks.
    pub fn set_health(&self, instance_id: &str, health: HealthChecks) {
        if let Some(instance) = self.state.lock().instances.get_mut(instance_id) {
            instance.health = health;
        }
    }

    /// Tags currently applied to an instance.
    pub fn tags(&self, instance_id: &str) -> HashMap<String, String> {
        self.state
            .lock()
            .instances
            .get(instance_id)
            .map(|instance| instance.tags.clone())
            .unwrap_or_default()
    }

    /// Instances which received a start request.
    pub fn started(&self) -> Vec<String> {
        self.state.lock().started.clone()
    }

    /// Instances which received a stop request.
    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().stopped.clone()
    }

    /// Current desired capacity of a group.
    pub fn desired(&self, group: &str) -> u32 {
        self.state
            .lock()
            .groups
            .get(group)
            .map(|capacity| capacity.desired)
            .unwrap_or_default()
    }

    /// Remove an instance from its group entirely.
    pub fn remove_instance(&self, instance_id: &str) {
        self.state.lock().instances.remove(instance_id);
    }

    /// Overwrite a group's capacity settings.
    pub fn set_capacity(&self, group: &str, min: u32, max: u32, desired: u32) {
        self.state
            .lock()
            .groups
            .insert(group.to_string(), GroupCapacity { min, max, desired });
    }
}

#[async_trait]
impl CloudControl for MockCloud {
    async fn describe(&self, instance_id: &str) -> Result<InstanceDescription, CloudError> {
        let state = self.state.lock();
        let instance =
            state
                .instances
                .get(instance_id)
                .ok_or_else(|| CloudError::InstanceNotFound {
                    instance_id: instance_id.to_string(),
                })?;
        Ok(InstanceDescription {
            instance_id: instance_id.to_string(),
            state: instance.state,
            private_ip: instance.private_ip.clone(),
            health: instance.health.clone(),
        })
    }

    async fn start(&self, instance_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        state.started.push(instance_id.to_string());
        if let Some(instance) = state.instances.get_mut(instance_id) {
            if instance.state.stopped() {
                instance.state = InstanceState::Pending;
            }
        }
        Ok(())
    }

    async fn stop(&self, instance_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        state.stopped.push(instance_id.to_string());
        if let Some(instance) = state.instances.get_mut(instance_id) {
            if instance.state.running() {
                instance.state = InstanceState::Stopping;
            }
        }
        Ok(())
    }

    async fn tag(
        &self,
        instance_id: &str,
        tags: &HashMap<String, String>,
    ) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        if let Some(instance) = state.instances.get_mut(instance_id) {
            for (key, value) in tags {
                instance.tags.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn group_members(&self, group: &str) -> Result<Vec<GroupMember>, CloudError> {
        let state = self.state.lock();
        if !state.groups.contains_key(group) {
            return Err(CloudError::GroupNotFound {
                group: group.to_string(),
            });
        }
        Ok(state
            .instances
            .iter()
            .filter(|(_, instance)| instance.group == group)
            .map(|(id, instance)| GroupMember {
                instance_id: id.clone(),
                lifecycle_state: instance.lifecycle_state,
            })
            .collect())
    }

    async fn group_capacity(&self, group: &str) -> Result<GroupCapacity, CloudError> {
        self.state
            .lock()
            .groups
            .get(group)
            .copied()
            .ok_or_else(|| CloudError::GroupNotFound {
                group: group.to_string(),
            })
    }

    async fn set_desired(&self, group: &str, desired: u32) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        let capacity = state
            .groups
            .get_mut(group)
            .ok_or_else(|| CloudError::GroupNotFound {
                group: group.to_string(),
            })?;
        if desired < capacity.min || desired > capacity.max {
            return Err(CloudError::CapacityBounds {
                group: group.to_string(),
                desired,
                min: capacity.min,
                max: capacity.max,
            });
        }
        capacity.desired = desired;
        Ok(())
    }
}
