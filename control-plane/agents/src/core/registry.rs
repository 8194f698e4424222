//! The registry bundles the persistent store, the port handles and the
//! configuration, and is passed explicitly to the services and the
//! reconciler.

use labpool_common::{
    cloud::CloudControl, config::OrchestratorConfig, gateway::GatewayOperations,
    store::definitions::Store,
};
use std::sync::Arc;

pub struct Registry<S: Store> {
    store: S,
    cloud: Arc<dyn CloudControl>,
    /// Gateway handle for the normal administrative path.
    gateway: Arc<dyn GatewayOperations>,
    /// Gateway handle with a short timeout, used for liveness probes and the
    /// termination path so a slow gateway cannot stall either.
    gateway_probe: Arc<dyn GatewayOperations>,
    config: Arc<OrchestratorConfig>,
}

impl<S: Store> Clone for Registry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cloud: self.cloud.clone(),
            gateway: self.gateway.clone(),
            gateway_probe: self.gateway_probe.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: Store> Registry<S> {
    pub fn new(
        store: S,
        cloud: Arc<dyn CloudControl>,
        gateway: Arc<dyn GatewayOperations>,
        gateway_probe: Arc<dyn GatewayOperations>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            store,
            cloud,
            gateway,
            gateway_probe,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cloud(&self) -> &Arc<dyn CloudControl> {
        &self.cloud
    }

    pub fn gateway(&self) -> &Arc<dyn GatewayOperations> {
        &self.gateway
    }

    pub fn gateway_probe(&self) -> &Arc<dyn GatewayOperations> {
        &self.gateway_probe
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}
