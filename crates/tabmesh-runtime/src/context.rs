//! Sync context
//!
//! One `SyncContext` per tab (or hub/server instance). It owns the identity,
//! clock, policy registry and dispatcher, and is passed explicitly to every
//! component that needs them. Transports are chosen from `RuntimeConfig`.

use std::sync::Arc;

use serde_json::Value;

use tabmesh_core::{
    system_clock, Identity, IdentityProvider, MeshError, MeshResult, SharedClock,
};
use tabmesh_policy::PolicyRegistry;
use tabmesh_transport::{
    HubConfig, HubEndpoint, HubTransport, LocalBus, LocalBusTransport, NetworkConnector,
    NetworkTransport, Transport, WsConnector,
};
use tabmesh_wire::RuntimeMessage;

use crate::{Dispatcher, RuntimeConfig};

/// Explicitly constructed runtime of one execution context
pub struct SyncContext {
    config: RuntimeConfig,
    dispatcher: Arc<Dispatcher>,
    hub: Option<HubTransport>,
    network: Option<NetworkTransport>,
}

impl SyncContext {
    pub fn builder() -> SyncContextBuilder {
        SyncContextBuilder::new(RuntimeConfig::default())
    }

    pub fn identity(&self) -> &Identity {
        self.dispatcher.identity()
    }

    pub fn clock(&self) -> &SharedClock {
        self.dispatcher.clock()
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        self.dispatcher.policies()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The hub client, when configured
    pub fn hub(&self) -> Option<&HubTransport> {
        self.hub.as_ref()
    }

    /// The network client, when configured
    pub fn network(&self) -> Option<&NetworkTransport> {
        self.network.as_ref()
    }

    pub fn emit_event(&self, event_type: &str, data: Value) -> RuntimeMessage {
        self.dispatcher.emit_event(event_type, data)
    }

    /// Bring up every transport; per-transport failures degrade, never abort
    pub async fn connect(&self) -> Vec<(String, MeshResult<()>)> {
        let results = self.dispatcher.connect_all().await;
        let up = results.iter().filter(|(_, r)| r.is_ok()).count();
        tracing::info!(
            context = %self.dispatcher.context_id(),
            connected = up,
            total = results.len(),
            "sync context started"
        );
        results
    }

    pub async fn shutdown(&self) {
        self.dispatcher.disconnect_all().await;
        tracing::info!(context = %self.dispatcher.context_id(), "sync context stopped");
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// Builder for `SyncContext`
pub struct SyncContextBuilder {
    config: RuntimeConfig,
    identity: Option<Identity>,
    clock: Option<SharedClock>,
    policies: Option<Arc<PolicyRegistry>>,
    local_bus: Option<LocalBus>,
    hub_endpoint: Option<HubEndpoint>,
    network_connector: Option<Arc<dyn NetworkConnector>>,
    extra: Vec<Arc<dyn Transport>>,
}

impl SyncContextBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        SyncContextBuilder {
            config,
            identity: None,
            clock: None,
            policies: None,
            local_bus: None,
            hub_endpoint: None,
            network_connector: None,
            extra: Vec::new(),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Identity source; a random identity is generated when unset
    pub fn identity(mut self, provider: &dyn IdentityProvider) -> Self {
        self.identity = Some(provider.identity());
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn policies(mut self, policies: Arc<PolicyRegistry>) -> Self {
        self.policies = Some(policies);
        self
    }

    /// Shared bus of the device; without one the local bus is unsupported
    pub fn local_bus(mut self, bus: LocalBus) -> Self {
        self.local_bus = Some(bus);
        self
    }

    /// Broker location; overrides the configured TCP address
    pub fn hub_endpoint(mut self, endpoint: HubEndpoint) -> Self {
        self.hub_endpoint = Some(endpoint);
        self
    }

    pub fn network_connector(mut self, connector: Arc<dyn NetworkConnector>) -> Self {
        self.network_connector = Some(connector);
        self
    }

    /// Register an additional transport after the configured ones
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.extra.push(transport);
        self
    }

    pub fn build(self) -> MeshResult<SyncContext> {
        let SyncContextBuilder {
            config,
            identity,
            clock,
            policies,
            local_bus,
            hub_endpoint,
            network_connector,
            extra,
        } = self;

        if config.context_id.as_deref().is_some_and(str::is_empty) {
            return Err(MeshError::Config("context_id must not be empty".into()));
        }
        if let Some(network) = &config.transports.network {
            if network.url.is_empty() {
                return Err(MeshError::Config("network url must not be empty".into()));
            }
        }

        let identity = identity.unwrap_or_else(Identity::generate);
        let clock = clock.unwrap_or_else(system_clock);
        let policies = policies.unwrap_or_else(|| Arc::new(PolicyRegistry::new()));
        let dispatcher = Dispatcher::new(
            identity.clone(),
            Arc::clone(&clock),
            policies,
            config.dispatcher(),
        );

        if config.transports.local_bus {
            let transport = match local_bus {
                Some(bus) => LocalBusTransport::new(bus, identity.tab_id.clone()),
                None => LocalBusTransport::unsupported(identity.tab_id.clone()),
            };
            dispatcher.register_transport(Arc::new(transport));
        }

        let hub_config = config
            .transports
            .hub
            .clone()
            .or_else(|| hub_endpoint.as_ref().map(|_| HubConfig::default()));
        let hub = hub_config.map(|hub_config| {
            let endpoint =
                hub_endpoint.unwrap_or_else(|| HubEndpoint::Tcp(hub_config.addr.clone()));
            HubTransport::with_queue(identity.clone(), endpoint, hub_config, &config.queue)
        });
        if let Some(hub) = &hub {
            dispatcher.register_transport(Arc::new(hub.clone()));
        }

        let network = config.transports.network.clone().map(|network_config| {
            let connector = network_connector.unwrap_or_else(|| Arc::new(WsConnector));
            NetworkTransport::build(
                identity.clone(),
                network_config,
                connector,
                &config.queue,
                Arc::clone(&clock),
            )
        });
        if let Some(network) = &network {
            dispatcher.register_transport(Arc::new(network.clone()));
        }

        for transport in extra {
            if let Some(replaced) = dispatcher.register_transport(transport) {
                tracing::warn!(transport = replaced.name(), "transport replaced");
            }
        }

        tracing::debug!(
            context = %dispatcher.context_id(),
            transports = ?dispatcher.transport_names(),
            "sync context built"
        );
        Ok(SyncContext {
            config,
            dispatcher,
            hub,
            network,
        })
    }
}
