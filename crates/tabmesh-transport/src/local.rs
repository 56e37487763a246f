//! Local bus transport
//!
//! Same-device, same-origin fan-out. Every tab context of one origin holds a
//! clone of the same `LocalBus`; a frame published by one tab reaches every
//! other subscribed tab, never the sender.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use tabmesh_core::{SyncScope, TabId};
use tabmesh_wire::RuntimeMessage;

use crate::{InboundHandler, Transport, TransportCounters, TransportError, TransportResult, TransportStats};

const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
struct BusFrame {
    from: TabId,
    bytes: Bytes,
}

/// Shared broadcast channel for one origin
#[derive(Clone, Debug)]
pub struct LocalBus {
    sender: broadcast::Sender<BusFrame>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        LocalBus { sender }
    }

    /// Number of attached tabs
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport over a `LocalBus`
pub struct LocalBusTransport {
    name: String,
    tab_id: TabId,
    bus: Option<LocalBus>,
    connected: AtomicBool,
    handler: Arc<RwLock<Option<InboundHandler>>>,
    counters: Arc<TransportCounters>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LocalBusTransport {
    pub const NAME: &'static str = "local_bus";

    pub fn new(bus: LocalBus, tab_id: TabId) -> Self {
        Self::build(Some(bus), tab_id)
    }

    /// No-op transport for environments without a shared bus
    ///
    /// Connecting succeeds but the transport stays disconnected, so the
    /// dispatcher skips it.
    pub fn unsupported(tab_id: TabId) -> Self {
        Self::build(None, tab_id)
    }

    fn build(bus: Option<LocalBus>, tab_id: TabId) -> Self {
        LocalBusTransport {
            name: Self::NAME.to_string(),
            tab_id,
            bus,
            connected: AtomicBool::new(false),
            handler: Arc::new(RwLock::new(None)),
            counters: Arc::new(TransportCounters::new()),
            task: Mutex::new(None),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn is_supported(&self) -> bool {
        self.bus.is_some()
    }
}

#[async_trait]
impl Transport for LocalBusTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> SyncScope {
        SyncScope::Device
    }

    fn send(&self, message: &RuntimeMessage) -> TransportResult<()> {
        let bus = match &self.bus {
            Some(bus) if self.is_connected() => bus,
            _ => return Err(TransportError::NotConnected),
        };
        let frame = BusFrame {
            from: self.tab_id.clone(),
            bytes: message.encode()?,
        };
        // Err only means no other tab is listening
        let _ = bus.sender.send(frame);
        self.counters.record_sent();
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
        let Some(bus) = &self.bus else {
            tracing::debug!(transport = %self.name, "local bus unsupported, staying disconnected");
            return Ok(());
        };
        if self.is_connected() {
            return Ok(());
        }

        let mut receiver = bus.sender.subscribe();
        let own_tab = self.tab_id.clone();
        let handler = Arc::clone(&self.handler);
        let counters = Arc::clone(&self.counters);
        let name = self.name.clone();

        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(frame) => {
                        if frame.from == own_tab {
                            continue;
                        }
                        counters.record_received();
                        let current = handler.read().clone();
                        if let Some(handler) = current {
                            handler(frame.bytes);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        counters.record_dropped();
                        tracing::warn!(transport = %name, skipped, "local bus receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        self.connected.store(true, Ordering::Release);
        tracing::info!(transport = %self.name, tab = %self.tab_id, "local bus connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for LocalBusTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
