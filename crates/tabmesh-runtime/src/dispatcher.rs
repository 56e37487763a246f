//! Message dispatcher
//!
//! Outbound: build the envelope, run local handlers, then fan out to every
//! transport whose scope covers the resolved target scope (throttled per
//! policy). Inbound: validate, loop-guard, dedup, run local handlers, then
//! relay the `mark_seen` envelope to sibling transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use tabmesh_core::{Identity, MeshError, MeshResult, SharedClock, SyncScope};
use tabmesh_policy::{resolve_event_scope, PolicyRegistry};
use tabmesh_transport::{OverflowHandler, QueueOverflow, Transport};
use tabmesh_wire::{
    check, create_message, mark_seen, types, Channel, MessageParams, MessageTarget,
    RuntimeMessage, Verdict,
};

use crate::{SeenCache, Submitted, Throttle, DEFAULT_SEEN_CAPACITY};

/// Local message handler
pub type MessageHandler = Arc<dyn Fn(&RuntimeMessage) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub const fn new(raw: u64) -> Self {
        SubscriptionId(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Handle returned by `subscribe`; pass it to `unsubscribe`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// `None` for wildcard subscriptions
    pub channel: Option<Channel>,
}

/// Outbound intent
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub params: MessageParams,
    /// Event policy key; defaults to the message type
    pub policy_key: Option<String>,
    /// Explicit target scope; overrides the policy
    pub scope: Option<SyncScope>,
    /// Apply the policy throttle
    pub throttle: bool,
}

impl DispatchRequest {
    pub fn new(params: MessageParams) -> Self {
        DispatchRequest {
            params,
            policy_key: None,
            scope: None,
            throttle: true,
        }
    }

    pub fn with_policy_key(mut self, key: impl Into<String>) -> Self {
        self.policy_key = Some(key.into());
        self
    }

    pub fn with_scope(mut self, scope: SyncScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn unthrottled(mut self) -> Self {
        self.throttle = false;
        self
    }
}

impl From<MessageParams> for DispatchRequest {
    fn from(params: MessageParams) -> Self {
        Self::new(params)
    }
}

/// Dispatcher configuration
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Loop-guard id; defaults to the tab id
    pub context_id: Option<String>,
    /// Re-forward accepted inbound messages to sibling transports
    pub relay_inbound: bool,
    /// Size of the recent message id window
    pub seen_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            context_id: None,
            relay_inbound: true,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
        }
    }
}

/// What happened to one inbound frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Local handlers ran
    Delivered,
    /// Addressed to another context; relayed only
    Passed,
    Malformed,
    Rejected(Verdict),
    Duplicate,
}

/// Dispatcher statistics snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub sent: u64,
    pub throttled: u64,
    pub received: u64,
    pub dropped_malformed: u64,
    pub dropped_loop: u64,
    pub dropped_duplicate: u64,
    pub relayed: u64,
    pub send_failures: u64,
}

#[derive(Default)]
struct DispatchCounters {
    dispatched: AtomicU64,
    sent: AtomicU64,
    throttled: AtomicU64,
    received: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_loop: AtomicU64,
    dropped_duplicate: AtomicU64,
    relayed: AtomicU64,
    send_failures: AtomicU64,
}

impl DispatchCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_loop: self.dropped_loop.load(Ordering::Relaxed),
            dropped_duplicate: self.dropped_duplicate.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

type HandlerList = Vec<(SubscriptionId, MessageHandler)>;

/// Routes messages between local handlers and transports
pub struct Dispatcher {
    me: Weak<Dispatcher>,
    identity: Identity,
    context_id: String,
    clock: SharedClock,
    policies: Arc<PolicyRegistry>,
    relay_inbound: bool,
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    handlers: RwLock<HashMap<Channel, HandlerList>>,
    wildcard: RwLock<HandlerList>,
    next_subscription: AtomicU64,
    throttle: Throttle<(RuntimeMessage, SyncScope)>,
    seen: Mutex<SeenCache>,
    overflow: RwLock<Option<OverflowHandler>>,
    counters: DispatchCounters,
}

impl Dispatcher {
    pub fn new(
        identity: Identity,
        clock: SharedClock,
        policies: Arc<PolicyRegistry>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        let context_id = config
            .context_id
            .unwrap_or_else(|| identity.context_id().to_string());

        Arc::new_cyclic(|me: &Weak<Dispatcher>| {
            let sink = me.clone();
            Dispatcher {
                me: me.clone(),
                identity,
                context_id,
                clock,
                policies,
                relay_inbound: config.relay_inbound,
                transports: RwLock::new(Vec::new()),
                handlers: RwLock::new(HashMap::new()),
                wildcard: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                throttle: Throttle::new(
                    move |_: &str, (message, scope): (RuntimeMessage, SyncScope)| {
                        if let Some(dispatcher) = sink.upgrade() {
                            dispatcher.send_to_transports(&message, scope);
                        }
                    },
                ),
                seen: Mutex::new(SeenCache::new(config.seen_capacity)),
                overflow: RwLock::new(None),
                counters: DispatchCounters::default(),
            }
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    // Transport registry

    /// Register a transport and route its inbound frames here
    ///
    /// A transport with the same name is replaced and returned.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        let name = transport.name().to_string();

        let weak = self.me.clone();
        let ingress = name.clone();
        transport.on_message(Arc::new(move |bytes: Bytes| {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.handle_inbound(&ingress, &bytes);
            }
        }));

        let weak = self.me.clone();
        transport.on_queue_overflow(Arc::new(move |overflow: QueueOverflow| {
            let handler = weak
                .upgrade()
                .and_then(|dispatcher| dispatcher.overflow.read().clone());
            if let Some(handler) = handler {
                handler(overflow);
            }
        }));

        tracing::debug!(transport = %name, scope = %transport.scope(), "registered transport");
        let mut transports = self.transports.write();
        match transports.iter().position(|t| t.name() == name) {
            Some(index) => Some(std::mem::replace(&mut transports[index], transport)),
            None => {
                transports.push(transport);
                None
            }
        }
    }

    pub fn unregister_transport(&self, name: &str) -> MeshResult<Arc<dyn Transport>> {
        let mut transports = self.transports.write();
        let index = transports
            .iter()
            .position(|t| t.name() == name)
            .ok_or_else(|| MeshError::TransportNotFound(name.to_string()))?;
        Ok(transports.remove(index))
    }

    pub fn transport(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.read().iter().find(|t| t.name() == name).cloned()
    }

    pub fn transport_names(&self) -> Vec<String> {
        self.transports
            .read()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    fn transport_snapshot(&self) -> Vec<Arc<dyn Transport>> {
        self.transports.read().clone()
    }

    // Subscriptions

    pub fn subscribe(
        &self,
        channel: Channel,
        handler: impl Fn(&RuntimeMessage) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id();
        self.handlers
            .write()
            .entry(channel)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            id,
            channel: Some(channel),
        }
    }

    /// Receive every message regardless of channel
    pub fn subscribe_all(
        &self,
        handler: impl Fn(&RuntimeMessage) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id();
        self.wildcard.write().push((id, Arc::new(handler)));
        Subscription { id, channel: None }
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let remove = |list: &mut HandlerList| {
            let before = list.len();
            list.retain(|(id, _)| *id != subscription.id);
            list.len() != before
        };
        match subscription.channel {
            Some(channel) => self
                .handlers
                .write()
                .get_mut(&channel)
                .map(remove)
                .unwrap_or(false),
            None => remove(&mut self.wildcard.write()),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    fn deliver_local(&self, message: &RuntimeMessage) {
        let mut targets: Vec<MessageHandler> = self
            .handlers
            .read()
            .get(&message.channel)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        targets.extend(self.wildcard.read().iter().map(|(_, h)| Arc::clone(h)));

        for handler in targets {
            handler(message);
        }
    }

    // Outbound

    /// Dispatch an outbound intent, returning the envelope that was built
    pub fn dispatch(&self, request: impl Into<DispatchRequest>) -> RuntimeMessage {
        let DispatchRequest {
            mut params,
            policy_key,
            scope,
            throttle,
        } = request.into();

        let key = policy_key.unwrap_or_else(|| params.message_type.clone());
        let policy = self.policies.resolve_event_policy(&key);
        let scope = scope.unwrap_or_else(|| resolve_event_scope(&policy));
        if params.priority == 0 {
            params.priority = policy.priority;
        }
        params.scope = Some(scope);

        let message = create_message(params, &self.identity, self.clock.now_ms());
        self.seen.lock().insert(&message.id);
        DispatchCounters::bump(&self.counters.dispatched);

        self.deliver_local(&message);

        if scope.is_local() {
            return message;
        }
        if throttle && policy.is_throttled() {
            let window = Duration::from_millis(policy.throttle_ms);
            match self.throttle.submit(&key, window, (message.clone(), scope)) {
                Submitted::Immediate => {}
                Submitted::Deferred | Submitted::Replaced => {
                    DispatchCounters::bump(&self.counters.throttled);
                }
            }
        } else {
            self.send_to_transports(&message, scope);
        }
        message
    }

    /// Emit a named application event on the events channel
    ///
    /// The event type selects the policy.
    pub fn emit_event(&self, event_type: &str, data: Value) -> RuntimeMessage {
        let params = MessageParams::new(Channel::Events, types::EMIT_EVENT)
            .with_payload(json!({ "eventType": event_type, "data": data }));
        self.dispatch(DispatchRequest::new(params).with_policy_key(event_type))
    }

    /// Send to every transport that can carry `scope`, returning the send count
    ///
    /// A failing transport is logged and skipped.
    pub fn send_to_transports(&self, message: &RuntimeMessage, scope: SyncScope) -> usize {
        if scope.is_local() {
            return 0;
        }
        let mut delivered = 0;
        for transport in self.transport_snapshot() {
            if !transport.accepts_outbound() || !transport.scope().covers(scope) {
                continue;
            }
            match transport.send(message) {
                Ok(()) => {
                    delivered += 1;
                    DispatchCounters::bump(&self.counters.sent);
                }
                Err(e) => {
                    DispatchCounters::bump(&self.counters.send_failures);
                    tracing::warn!(
                        transport = transport.name(),
                        message_id = %message.id,
                        "send failed: {}",
                        e
                    );
                }
            }
        }
        delivered
    }

    // Inbound

    /// Process one raw frame received on `transport_name`
    ///
    /// Never fails: bad frames are counted and dropped.
    pub fn handle_inbound(&self, transport_name: &str, bytes: &[u8]) -> Inbound {
        DispatchCounters::bump(&self.counters.received);

        let message = match RuntimeMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                DispatchCounters::bump(&self.counters.dropped_malformed);
                tracing::warn!(transport = transport_name, "dropping malformed message: {}", e);
                return Inbound::Malformed;
            }
        };

        let verdict = check(&message, &self.context_id, self.clock.now_ms());
        if !verdict.is_accept() {
            DispatchCounters::bump(&self.counters.dropped_loop);
            if verdict == Verdict::HopLimit {
                tracing::warn!(
                    transport = transport_name,
                    message_id = %message.id,
                    hop_count = message.loop_guard.hop_count,
                    "dropping message over hop limit"
                );
            } else {
                tracing::debug!(message_id = %message.id, ?verdict, "dropped by loop guard");
            }
            return Inbound::Rejected(verdict);
        }

        if !self.seen.lock().insert(&message.id) {
            DispatchCounters::bump(&self.counters.dropped_duplicate);
            tracing::debug!(message_id = %message.id, transport = transport_name, "duplicate");
            return Inbound::Duplicate;
        }

        let outcome = if self.is_addressed_here(&message) {
            self.deliver_local(&message);
            Inbound::Delivered
        } else {
            Inbound::Passed
        };

        if self.relay_inbound {
            self.relay(transport_name, &message);
        }
        outcome
    }

    fn is_addressed_here(&self, message: &RuntimeMessage) -> bool {
        match (message.target, message.target_id.as_deref()) {
            (MessageTarget::Specific, Some(target)) => {
                target == self.identity.tab_id.as_str() || target == self.context_id
            }
            _ => true,
        }
    }

    fn relay(&self, ingress: &str, message: &RuntimeMessage) {
        let target = message.scope.unwrap_or(SyncScope::Device);
        let transports = self.transport_snapshot();
        let ingress_scope = transports
            .iter()
            .find(|t| t.name() == ingress)
            .map(|t| t.scope());

        let mut relayed: Option<RuntimeMessage> = None;
        for transport in transports {
            if transport.name() == ingress || !transport.accepts_outbound() {
                continue;
            }
            let scope = transport.scope();
            let narrowing = scope <= target;
            let widening = ingress_scope.is_some_and(|s| s < target) && scope.covers(target);
            if !(narrowing || widening) {
                continue;
            }

            let envelope = relayed.get_or_insert_with(|| mark_seen(message, &self.context_id));
            match transport.send(envelope) {
                Ok(()) => DispatchCounters::bump(&self.counters.relayed),
                Err(e) => {
                    DispatchCounters::bump(&self.counters.send_failures);
                    tracing::warn!(
                        transport = transport.name(),
                        message_id = %message.id,
                        "relay failed: {}",
                        e
                    );
                }
            }
        }
    }

    // Lifecycle

    /// Connect every registered transport in registration order
    ///
    /// Failures are reported per transport; the dispatcher keeps working
    /// with whatever connected.
    pub async fn connect_all(&self) -> Vec<(String, MeshResult<()>)> {
        let mut results = Vec::new();
        for transport in self.transport_snapshot() {
            let name = transport.name().to_string();
            let result = transport.connect().await.map_err(MeshError::from);
            match &result {
                Ok(()) => tracing::info!(transport = %name, "transport connected"),
                Err(e) => tracing::warn!(transport = %name, "transport unavailable: {}", e),
            }
            results.push((name, result));
        }
        results
    }

    /// Flush pending throttled sends, then disconnect every transport
    pub async fn disconnect_all(&self) {
        self.throttle.flush_all();
        for transport in self.transport_snapshot() {
            transport.disconnect().await;
        }
    }

    /// Observe outbound queue overflow on any registered transport
    pub fn on_queue_overflow(&self, handler: impl Fn(QueueOverflow) + Send + Sync + 'static) {
        *self.overflow.write() = Some(Arc::new(handler));
    }

    /// Throttled sends waiting for their window
    pub fn pending_throttled(&self) -> usize {
        self.throttle.pending_count()
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("context_id", &self.context_id)
            .field("transports", &self.transport_names())
            .field("stats", &self.stats())
            .finish()
    }
}
