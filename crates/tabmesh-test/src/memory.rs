//! In-memory transport
//!
//! `MemoryTransport` records every send and lets a test inject inbound
//! frames and flip connectivity. Transports joined to the same `Medium`
//! deliver to each other synchronously, which makes multi-context meshes
//! deterministic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use tabmesh_core::SyncScope;
use tabmesh_transport::{
    InboundHandler, Transport, TransportCounters, TransportError, TransportResult, TransportStats,
};
use tabmesh_wire::RuntimeMessage;

/// A shared wire joining several memory transports
#[derive(Clone, Default)]
pub struct Medium {
    members: Arc<RwLock<Vec<(u64, Weak<MemoryTransport>)>>>,
}

impl Medium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members
            .read()
            .iter()
            .filter(|(_, m)| m.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn join(&self, member: &Arc<MemoryTransport>) {
        self.members.write().push((member.id, Arc::downgrade(member)));
    }

    fn deliver_from(&self, sender: u64, frame: &Bytes) -> usize {
        let peers: Vec<Arc<MemoryTransport>> = self
            .members
            .read()
            .iter()
            .filter(|(id, _)| *id != sender)
            .filter_map(|(_, m)| m.upgrade())
            .collect();
        let mut delivered = 0;
        for peer in peers {
            if peer.receive(frame.clone()) {
                delivered += 1;
            }
        }
        delivered
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct MemoryTransport {
    id: u64,
    name: String,
    scope: SyncScope,
    connected: AtomicBool,
    failing: AtomicBool,
    medium: Option<Medium>,
    sent: Mutex<Vec<RuntimeMessage>>,
    handler: RwLock<Option<InboundHandler>>,
    counters: TransportCounters,
}

impl MemoryTransport {
    /// Standalone transport; sends are only recorded
    pub fn new(name: impl Into<String>, scope: SyncScope) -> Arc<Self> {
        Arc::new(Self::build(name.into(), scope, None))
    }

    /// Transport delivering to every other member of `medium`
    pub fn on_medium(name: impl Into<String>, scope: SyncScope, medium: &Medium) -> Arc<Self> {
        let transport = Arc::new(Self::build(name.into(), scope, Some(medium.clone())));
        medium.join(&transport);
        transport
    }

    fn build(name: String, scope: SyncScope, medium: Option<Medium>) -> Self {
        MemoryTransport {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            scope,
            connected: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            medium,
            sent: Mutex::new(Vec::new()),
            handler: RwLock::new(None),
            counters: TransportCounters::new(),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Make `send` return an error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn sent(&self) -> Vec<RuntimeMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Deliver a message as if it arrived on this transport
    pub fn inject(&self, message: &RuntimeMessage) -> TransportResult<()> {
        let frame = message.encode()?;
        self.inject_bytes(frame);
        Ok(())
    }

    pub fn inject_bytes(&self, frame: impl Into<Bytes>) {
        self.receive(frame.into());
    }

    fn receive(&self, frame: Bytes) -> bool {
        if !self.is_connected() {
            return false;
        }
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => {
                self.counters.record_received();
                handler(frame);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> SyncScope {
        self.scope
    }

    fn send(&self, message: &RuntimeMessage) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.failing.load(Ordering::Acquire) {
            return Err(TransportError::SendFailed("injected failure".into()));
        }
        self.sent.lock().push(message.clone());
        self.counters.record_sent();

        if let Some(medium) = &self.medium {
            let frame = message.encode()?;
            let delivered = medium.deliver_from(self.id, &frame);
            tracing::trace!(transport = %self.name, delivered, "memory frame delivered");
        }
        Ok(())
    }

    fn on_message(&self, handler: InboundHandler) {
        *self.handler.write() = Some(handler);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot(0)
    }

    async fn connect(&self) -> TransportResult<()> {
        self.set_connected(true);
        Ok(())
    }

    async fn disconnect(&self) {
        self.set_connected(false);
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("connected", &self.is_connected())
            .field("sent", &self.sent_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabmesh_core::Identity;
    use tabmesh_wire::{create_message, Channel, MessageParams};

    fn message() -> RuntimeMessage {
        create_message(
            MessageParams::new(Channel::Events, "emit_event"),
            &Identity::generate(),
            0,
        )
    }

    fn counting(transport: &MemoryTransport) -> Arc<AtomicU64> {
        let count = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&count);
        transport.on_message(Arc::new(move |_| {
            sink.fetch_add(1, Ordering::Relaxed);
        }));
        count
    }

    #[test]
    fn test_records_and_fails_on_demand() {
        let transport = MemoryTransport::new("net", SyncScope::Canvas);
        transport.send(&message()).unwrap();
        assert_eq!(transport.sent_count(), 1);

        transport.set_failing(true);
        assert!(matches!(transport.send(&message()), Err(TransportError::SendFailed(_))));
        transport.set_connected(false);
        assert!(matches!(transport.send(&message()), Err(TransportError::NotConnected)));
        assert_eq!(transport.stats().sent, 1);
    }

    #[test]
    fn test_medium_delivers_to_others_only() {
        let medium = Medium::new();
        let a = MemoryTransport::on_medium("bus", SyncScope::Device, &medium);
        let b = MemoryTransport::on_medium("bus", SyncScope::Device, &medium);
        let c = MemoryTransport::on_medium("bus", SyncScope::Device, &medium);
        let (at_a, at_b, at_c) = (counting(&a), counting(&b), counting(&c));

        c.set_connected(false);
        a.send(&message()).unwrap();

        assert_eq!(at_a.load(Ordering::Relaxed), 0);
        assert_eq!(at_b.load(Ordering::Relaxed), 1);
        assert_eq!(at_c.load(Ordering::Relaxed), 0);
        assert_eq!(medium.len(), 3);

        drop(b);
        assert_eq!(medium.len(), 2);
    }
}
