//! Runtime message envelope
//!
//! One `RuntimeMessage` exists per logical event. Once created it is never
//! mutated in place; relaying produces a new envelope via `mark_seen`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tabmesh_core::{Identity, SyncScope};

/// Literal version tag carried by every envelope
pub const PROTOCOL_VERSION: u64 = 1;

/// Which kind of context produced the message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    #[default]
    Tab,
    Hub,
    Server,
    /// Reserved for future context kinds
    Reserved,
}

impl MessageSource {
    /// Hub and server are authoritative for worker-owned state
    pub fn is_authority(self) -> bool {
        matches!(self, MessageSource::Hub | MessageSource::Server)
    }
}

/// Delivery intent (not transport selection)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageTarget {
    #[default]
    Broadcast,
    Specific,
    Pipeline,
    Widget,
    Canvas,
}

impl MessageTarget {
    /// Targets that address a single recipient and need a `targetId`
    pub fn requires_target_id(self) -> bool {
        matches!(self, MessageTarget::Specific | MessageTarget::Widget)
    }
}

/// Local handler routing key, independent of transport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Events,
    State,
    Presence,
    Cursor,
    Debug,
    Pipeline,
    System,
    Ai,
    Permissions,
}

impl Channel {
    pub const ALL: [Channel; 9] = [
        Channel::Events,
        Channel::State,
        Channel::Presence,
        Channel::Cursor,
        Channel::Debug,
        Channel::Pipeline,
        Channel::System,
        Channel::Ai,
        Channel::Permissions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Events => "events",
            Channel::State => "state",
            Channel::Presence => "presence",
            Channel::Cursor => "cursor",
            Channel::Debug => "debug",
            Channel::Pipeline => "pipeline",
            Channel::System => "system",
            Channel::Ai => "ai",
            Channel::Permissions => "permissions",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loop-prevention metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopGuard {
    /// Context ids that have processed this message, origin first
    pub seen_by: Vec<String>,
    /// Creation time at the origin (ms since epoch)
    pub origin_timestamp: u64,
    /// Number of relays so far
    pub hop_count: u32,
}

impl LoopGuard {
    pub fn new(origin: &str, origin_timestamp: u64) -> Self {
        LoopGuard {
            seen_by: vec![origin.to_string()],
            origin_timestamp,
            hop_count: 0,
        }
    }

    #[inline]
    pub fn has_seen(&self, context_id: &str) -> bool {
        self.seen_by.iter().any(|id| id == context_id)
    }
}

/// The wire envelope
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeMessage {
    pub version: u64,
    pub id: String,
    pub source: MessageSource,
    pub target: MessageTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub channel: Channel,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: u64,
    pub identity: Identity,
    pub loop_guard: LoopGuard,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to_id: Option<String>,
    /// Expiry in ms relative to `loop_guard.origin_timestamp`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Target scope resolved at the origin; bounds how far relays may carry it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<SyncScope>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub requires_ack: bool,
}

impl RuntimeMessage {
    /// Origin context id (the first entry of `seen_by`)
    pub fn origin(&self) -> &str {
        self.loop_guard
            .seen_by
            .first()
            .map(String::as_str)
            .unwrap_or_else(|| self.identity.tab_id.as_str())
    }

    /// Age relative to the origin timestamp
    #[inline]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.loop_guard.origin_timestamp)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.ttl.is_some_and(|ttl| self.age_ms(now_ms) > ttl)
    }

    /// Parameters for a response correlated to this message
    pub fn reply_to(&self, message_type: impl Into<String>, payload: Value) -> MessageParams {
        let mut params = MessageParams::new(self.channel, message_type)
            .with_payload(payload)
            .to_target(MessageTarget::Specific, self.origin().to_string());
        params.response_to_id = Some(self.request_id.clone().unwrap_or_else(|| self.id.clone()));
        params
    }
}

/// Parameters for `create_message`
#[derive(Clone, Debug)]
pub struct MessageParams {
    pub channel: Channel,
    pub message_type: String,
    pub payload: Value,
    pub source: MessageSource,
    pub target: MessageTarget,
    pub target_id: Option<String>,
    pub request_id: Option<String>,
    pub response_to_id: Option<String>,
    pub ttl: Option<u64>,
    pub scope: Option<SyncScope>,
    pub priority: i32,
    pub requires_ack: bool,
}

impl MessageParams {
    pub fn new(channel: Channel, message_type: impl Into<String>) -> Self {
        MessageParams {
            channel,
            message_type: message_type.into(),
            payload: Value::Null,
            source: MessageSource::Tab,
            target: MessageTarget::Broadcast,
            target_id: None,
            request_id: None,
            response_to_id: None,
            ttl: None,
            scope: None,
            priority: 0,
            requires_ack: false,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn from_source(mut self, source: MessageSource) -> Self {
        self.source = source;
        self
    }

    pub fn to_target(mut self, target: MessageTarget, target_id: impl Into<String>) -> Self {
        self.target = target;
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_target(mut self, target: MessageTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl = Some(ttl_ms);
        self
    }

    pub fn with_scope(mut self, scope: SyncScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark as a request; a fresh request id is generated
    pub fn as_request(mut self) -> Self {
        self.request_id = Some(generate_message_id());
        self
    }

    pub fn requiring_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }
}

/// Globally unique message id
pub fn generate_message_id() -> String {
    let value: u128 = rand::thread_rng().gen();
    format!("msg_{:032x}", value)
}

/// Build an envelope stamped with the origin identity
///
/// The loop guard starts as `{seen_by: [tab_id], origin_timestamp: now, hop_count: 0}`.
pub fn create_message(params: MessageParams, identity: &Identity, now_ms: u64) -> RuntimeMessage {
    RuntimeMessage {
        version: PROTOCOL_VERSION,
        id: generate_message_id(),
        source: params.source,
        target: params.target,
        target_id: params.target_id,
        channel: params.channel,
        message_type: params.message_type,
        payload: params.payload,
        timestamp: now_ms,
        identity: identity.clone(),
        loop_guard: LoopGuard::new(identity.tab_id.as_str(), now_ms),
        request_id: params.request_id,
        response_to_id: params.response_to_id,
        ttl: params.ttl,
        scope: params.scope,
        priority: params.priority,
        requires_ack: params.requires_ack,
    }
}
