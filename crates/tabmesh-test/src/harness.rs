//! Context harness
//!
//! A `TestContext` is one dispatcher on a manual clock with memory
//! transports and a log of every message its handlers saw.

use std::sync::Arc;

use parking_lot::Mutex;

use tabmesh_core::{Identity, ManualClock, SyncScope};
use tabmesh_policy::PolicyRegistry;
use tabmesh_runtime::{Dispatcher, DispatcherConfig};
use tabmesh_wire::RuntimeMessage;

use crate::{Medium, MemoryTransport};

pub const LOCAL_BUS: &str = "local_bus";
pub const HUB: &str = "hub";
pub const NETWORK: &str = "network";

pub struct TestContext {
    pub clock: Arc<ManualClock>,
    pub dispatcher: Arc<Dispatcher>,
    transports: Mutex<Vec<Arc<MemoryTransport>>>,
    log: Arc<Mutex<Vec<RuntimeMessage>>>,
}

impl TestContext {
    pub fn new(identity: Identity, clock: Arc<ManualClock>) -> Self {
        Self::with_config(identity, clock, DispatcherConfig::default())
    }

    pub fn with_config(identity: Identity, clock: Arc<ManualClock>, config: DispatcherConfig) -> Self {
        let dispatcher = Dispatcher::new(
            identity,
            clock.clone(),
            Arc::new(PolicyRegistry::new()),
            config,
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        dispatcher.subscribe_all(move |message| sink.lock().push(message.clone()));
        TestContext {
            clock,
            dispatcher,
            transports: Mutex::new(Vec::new()),
            log,
        }
    }

    /// Tab on `device` with standalone bus, hub and network transports
    pub fn standard(device: &str, tab: &str) -> Self {
        let context = Self::new(
            Identity::new(device.into(), tab.into(), "session".into()),
            ManualClock::shared(1_000),
        );
        context.attach(MemoryTransport::new(LOCAL_BUS, SyncScope::Device));
        context.attach(MemoryTransport::new(HUB, SyncScope::Device));
        context.attach(MemoryTransport::new(NETWORK, SyncScope::Canvas));
        context
    }

    pub fn attach(&self, transport: Arc<MemoryTransport>) -> Arc<MemoryTransport> {
        self.dispatcher.register_transport(transport.clone());
        self.transports.lock().push(Arc::clone(&transport));
        transport
    }

    /// Join `medium` under `name`
    pub fn join(&self, name: &str, scope: SyncScope, medium: &Medium) -> Arc<MemoryTransport> {
        self.attach(MemoryTransport::on_medium(name, scope, medium))
    }

    pub fn transport(&self, name: &str) -> Option<Arc<MemoryTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|t| tabmesh_transport::Transport::name(t.as_ref()) == name)
            .cloned()
    }

    pub fn tab_id(&self) -> &str {
        self.dispatcher.identity().tab_id.as_str()
    }

    /// Every message local handlers saw, own dispatches included
    pub fn handled(&self) -> Vec<RuntimeMessage> {
        self.log.lock().clone()
    }

    /// Handled messages that came from other contexts
    pub fn received(&self) -> Vec<RuntimeMessage> {
        let own = self.tab_id().to_string();
        self.log
            .lock()
            .iter()
            .filter(|m| m.identity.tab_id.as_str() != own)
            .cloned()
            .collect()
    }

    /// Sends per transport name, in attach order
    pub fn send_counts(&self) -> Vec<(String, usize)> {
        self.transports
            .lock()
            .iter()
            .map(|t| (tabmesh_transport::Transport::name(t.as_ref()).to_string(), t.sent_count()))
            .collect()
    }

    pub fn total_sent(&self) -> usize {
        self.transports.lock().iter().map(|t| t.sent_count()).sum()
    }
}
