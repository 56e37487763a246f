//! Transport abstraction
//!
//! A transport is one delivery channel with a declared reach (`scope`).
//! The dispatcher never knows how bytes move; it only compares scopes and
//! calls `send`. Inbound frames are handed to the registered handler as raw
//! bytes so the dispatcher can validate them in one place.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use tabmesh_core::SyncScope;
use tabmesh_wire::RuntimeMessage;

use crate::TransportResult;

/// Receives one raw inbound frame
pub type InboundHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Receives connection lifecycle changes
pub type StateChangeHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Receives outbound queue overflow notices
pub type OverflowHandler = Arc<dyn Fn(QueueOverflow) + Send + Sync>;

/// A delivery channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Registry name, unique per dispatcher
    fn name(&self) -> &str;

    /// Broadest scope this transport reaches
    fn scope(&self) -> SyncScope;

    /// Enqueue a message for delivery. Never blocks.
    fn send(&self, message: &RuntimeMessage) -> TransportResult<()>;

    /// Install the inbound frame handler, replacing any previous one
    fn on_message(&self, handler: InboundHandler);

    fn is_connected(&self) -> bool;

    /// Connected, or able to queue until the link comes back
    fn accepts_outbound(&self) -> bool {
        self.is_connected()
    }

    /// Install the overflow handler. Transports without a queue ignore it.
    fn on_queue_overflow(&self, _handler: OverflowHandler) {}

    fn stats(&self) -> TransportStats;

    async fn connect(&self) -> TransportResult<()>;

    async fn disconnect(&self);
}

/// Link lifecycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting { attempt: u32 },
    /// Terminal; no further attempts are made
    Failed { reason: String },
}

impl ConnectionState {
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// States in which outbound sends are queued rather than refused
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Reconnecting { .. }
        )
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed { .. })
    }
}

/// Outbound queue overflow notice
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueOverflow {
    pub transport: String,
    /// Id of the message that was dropped to make room
    pub dropped_id: String,
    pub total_dropped: u64,
}

/// Transport statistics snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub sent: u64,
    pub received: u64,
    pub queued: u64,
    pub dropped: u64,
}

/// Lock-free counters backing `TransportStats`
#[derive(Debug, Default)]
pub struct TransportCounters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl TransportCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the new total
    #[inline]
    pub fn record_dropped(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self, queued: usize) -> TransportStats {
        TransportStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            queued: queued as u64,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
