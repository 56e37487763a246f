//! Bounded outbound queue
//!
//! FIFO with oldest-drop on overflow. Queued messages keep their original
//! order across reconnects; `requeue_front` puts back frames a dead writer
//! never got to send.

use std::collections::VecDeque;

use serde::Deserialize;

use tabmesh_wire::RuntimeMessage;

use crate::{OverflowHandler, QueueOverflow, TransportCounters};

/// Default queue bound
pub const DEFAULT_MAX_QUEUED: usize = 1000;

/// Queue sizing
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct QueueConfig {
    pub max_queued: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_queued: DEFAULT_MAX_QUEUED,
        }
    }
}

impl QueueConfig {
    pub fn with_max_queued(mut self, max_queued: usize) -> Self {
        self.max_queued = max_queued;
        self
    }
}

/// Outbound queue of envelopes
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<RuntimeMessage>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        OutboundQueue {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.max_queued)
    }

    /// Append a message; returns the evicted oldest message on overflow
    pub fn push(&mut self, message: RuntimeMessage) -> Option<RuntimeMessage> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(message);
        evicted
    }

    /// Put unsent messages back at the head, preserving their order
    ///
    /// Over capacity the oldest messages go first; they are returned oldest
    /// first so the caller can report them.
    pub fn requeue_front(&mut self, messages: Vec<RuntimeMessage>) -> Vec<RuntimeMessage> {
        for message in messages.into_iter().rev() {
            self.items.push_front(message);
        }
        let excess = self.items.len().saturating_sub(self.capacity);
        self.items.drain(..excess).collect()
    }

    /// Take everything in FIFO order
    pub fn drain(&mut self) -> Vec<RuntimeMessage> {
        self.items.drain(..).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUED)
    }
}

/// Log, count and surface an evicted message
pub(crate) fn report_overflow(
    transport: &str,
    evicted: &RuntimeMessage,
    counters: &TransportCounters,
    handler: Option<OverflowHandler>,
) {
    let total_dropped = counters.record_dropped();
    tracing::warn!(
        transport = %transport,
        message_id = %evicted.id,
        total_dropped,
        "outbound queue full, dropped oldest message"
    );
    if let Some(handler) = handler {
        handler(QueueOverflow {
            transport: transport.to_string(),
            dropped_id: evicted.id.clone(),
            total_dropped,
        });
    }
}
