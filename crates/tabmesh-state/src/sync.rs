//! Policy-gated state sync over the dispatcher
//!
//! Outbound writes are gated by `should_sync_state` and stripped with
//! `filter_for_sync` before anything is serialized. Inbound `state_update`
//! and `state_response` messages are reconciled into the local store under
//! the state type's conflict strategy. Proposals go through the optimistic
//! store and settle when an authority answers: a `state_response` commits,
//! a `state_conflict` rolls back.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use tabmesh_core::SyncScope;
use tabmesh_policy::{filter_for_sync, should_sync_state, StateSyncPolicy};
use tabmesh_runtime::{DispatchRequest, Dispatcher, Subscription, Throttle};
use tabmesh_wire::{types, Channel, MessageParams, RuntimeMessage};

use crate::{ApplyOutcome, OptimisticStore, RemoteState, StateResult, StateStore};

/// Body of `state_update`, `state_response` and `state_conflict`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePayload {
    pub state_type: String,
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub timestamp: u64,
}

/// Result of a local publish
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Published {
    Sent,
    /// Coalesced into the state type's throttle window
    Deferred,
    /// Policy keeps this state type below the requested scope
    NotShared,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StateChange {
    pub state_type: String,
    pub value: Option<Value>,
    pub outcome: ApplyOutcome,
    /// Context whose write caused the change
    pub origin: String,
}

pub type StateChangeHandler = Arc<dyn Fn(&StateChange) + Send + Sync>;

struct Outbound {
    state_type: String,
    state: Value,
    scope: SyncScope,
    request_id: Option<String>,
}

pub struct StateSync {
    dispatcher: Arc<Dispatcher>,
    store: RwLock<StateStore>,
    proposals: Mutex<OptimisticStore<Value>>,
    throttle: Throttle<Outbound>,
    on_change: RwLock<Option<StateChangeHandler>>,
    subscription: Mutex<Option<Subscription>>,
}

impl StateSync {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let sync = Arc::new_cyclic(|me: &Weak<StateSync>| {
            let sink = me.clone();
            StateSync {
                dispatcher: Arc::clone(&dispatcher),
                store: RwLock::new(StateStore::new()),
                proposals: Mutex::new(OptimisticStore::new()),
                throttle: Throttle::new(move |_: &str, outbound: Outbound| {
                    if let Some(sync) = sink.upgrade() {
                        sync.send(outbound);
                    }
                }),
                on_change: RwLock::new(None),
                subscription: Mutex::new(None),
            }
        });

        let weak = Arc::downgrade(&sync);
        let subscription = dispatcher.subscribe(Channel::State, move |message| {
            if let Some(sync) = weak.upgrade() {
                sync.handle_message(message);
            }
        });
        *sync.subscription.lock() = Some(subscription);
        sync
    }

    pub fn on_change(&self, handler: impl Fn(&StateChange) + Send + Sync + 'static) {
        *self.on_change.write() = Some(Arc::new(handler));
    }

    pub fn get(&self, state_type: &str) -> Option<Value> {
        self.store.read().value(state_type).cloned()
    }

    pub fn state_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.store.read().iter().map(|(k, _)| k.clone()).collect();
        types.sort();
        types
    }

    fn policy(&self, state_type: &str) -> StateSyncPolicy {
        self.dispatcher.policies().resolve_state_policy(state_type)
    }

    fn now(&self) -> u64 {
        self.dispatcher.clock().now_ms()
    }

    fn own_id(&self) -> &str {
        self.dispatcher.identity().tab_id.as_str()
    }

    /// Write locally and share up to `target_scope` if policy allows
    pub fn publish(&self, state_type: &str, value: &Value, target_scope: SyncScope) -> Published {
        self.store
            .write()
            .set_local(state_type, value.clone(), self.now(), self.own_id());
        self.share(state_type, value, target_scope, None)
    }

    /// Tentatively apply `value`; it settles when an authority answers `op_id`
    ///
    /// A proposal the policy never shares has nobody to answer it and commits
    /// immediately.
    pub fn propose(
        &self,
        op_id: &str,
        state_type: &str,
        value: &Value,
        target_scope: SyncScope,
    ) -> StateResult<Published> {
        {
            let mut proposals = self.proposals.lock();
            if !proposals.has_pending(state_type) {
                if let Some(current) = self.store.read().value(state_type) {
                    proposals.rebase(state_type, current.clone());
                }
            }
            proposals.apply_tentative(op_id, state_type, value.clone())?;
        }
        self.store
            .write()
            .set_local(state_type, value.clone(), self.now(), self.own_id());

        let published = self.share(state_type, value, target_scope, Some(op_id.to_string()));
        if published == Published::NotShared {
            self.proposals.lock().confirm(op_id)?;
        }
        Ok(published)
    }

    pub fn confirm(&self, op_id: &str) -> StateResult<()> {
        self.proposals.lock().confirm(op_id)
    }

    /// Roll back a proposal and restore what lay beneath it
    pub fn reject(&self, op_id: &str) -> StateResult<Option<Value>> {
        let (state_type, restored) = {
            let mut proposals = self.proposals.lock();
            let state_type = proposals.key_of(op_id).map(str::to_string);
            let restored = proposals.reject(op_id)?;
            (state_type, restored)
        };
        let Some(state_type) = state_type else {
            return Ok(restored);
        };

        {
            let mut store = self.store.write();
            match &restored {
                Some(value) => store.set_local(&state_type, value.clone(), self.now(), self.own_id()),
                None => {
                    store.remove(&state_type);
                }
            }
        }
        tracing::debug!(op_id, state_type = %state_type, "proposal rolled back");
        self.notify(StateChange {
            state_type,
            value: restored.clone(),
            outcome: ApplyOutcome::RolledBack,
            origin: self.own_id().to_string(),
        });
        Ok(restored)
    }

    pub fn pending_proposals(&self) -> usize {
        self.proposals.lock().pending().count()
    }

    /// Ask other contexts for their value of `state_type`
    pub fn request(&self, state_type: &str, target_scope: SyncScope) -> RuntimeMessage {
        let params = MessageParams::new(Channel::State, types::STATE_REQUEST)
            .with_payload(json!({ "stateType": state_type }))
            .as_request();
        self.dispatcher.dispatch(
            DispatchRequest::new(params)
                .with_policy_key(policy_key(state_type))
                .with_scope(target_scope)
                .unthrottled(),
        )
    }

    fn share(
        &self,
        state_type: &str,
        value: &Value,
        target_scope: SyncScope,
        request_id: Option<String>,
    ) -> Published {
        let policy = self.policy(state_type);
        if !should_sync_state(&policy, target_scope) {
            tracing::debug!(state_type, ?target_scope, "state not shared at this scope");
            return Published::NotShared;
        }
        let outbound = Outbound {
            state_type: state_type.to_string(),
            state: filter_for_sync(value, &policy),
            scope: target_scope,
            request_id,
        };

        if policy.throttle_ms > 0 && outbound.request_id.is_none() {
            let window = Duration::from_millis(policy.throttle_ms);
            return match self.throttle.submit(state_type, window, outbound) {
                tabmesh_runtime::Submitted::Immediate => Published::Sent,
                _ => Published::Deferred,
            };
        }
        self.send(outbound);
        Published::Sent
    }

    fn send(&self, outbound: Outbound) {
        let payload = json!({
            "stateType": outbound.state_type,
            "state": outbound.state,
            "timestamp": self.now(),
        });
        let mut params = MessageParams::new(Channel::State, types::STATE_UPDATE).with_payload(payload);
        params.request_id = outbound.request_id;
        self.dispatcher.dispatch(
            DispatchRequest::new(params)
                .with_policy_key(policy_key(&outbound.state_type))
                .with_scope(outbound.scope)
                .unthrottled(),
        );
    }

    fn notify(&self, change: StateChange) {
        let handler = self.on_change.read().clone();
        if let Some(handler) = handler {
            handler(&change);
        }
    }

    fn handle_message(&self, message: &RuntimeMessage) {
        if message.identity.tab_id.as_str() == self.own_id() {
            return;
        }
        match message.message_type.as_str() {
            types::STATE_UPDATE | types::STATE_RESPONSE => self.handle_update(message),
            types::STATE_REQUEST => self.handle_request(message),
            types::STATE_CONFLICT => self.handle_conflict(message),
            other => tracing::trace!(message_type = other, "ignoring state message"),
        }
    }

    fn handle_update(&self, message: &RuntimeMessage) {
        let Some(payload) = parse_payload(message) else {
            return;
        };
        let policy = self.policy(&payload.state_type);
        if !should_sync_state(&policy, message.scope.unwrap_or(SyncScope::Device)) {
            tracing::debug!(
                message_id = %message.id,
                state_type = %payload.state_type,
                "state update beyond policy scope"
            );
            return;
        }

        if message.source.is_authority() {
            if let Some(op_id) = &message.response_to_id {
                match self.proposals.lock().confirm(op_id) {
                    Ok(()) => tracing::debug!(op_id = %op_id, "proposal confirmed"),
                    Err(e) => tracing::debug!("confirmation ignored: {}", e),
                }
            }
        }

        let remote = RemoteState {
            state_type: payload.state_type.clone(),
            value: payload.state,
            timestamp: payload.timestamp,
            origin: message.origin().to_string(),
            source: message.source,
        };

        // Authority writes land beneath pending proposals
        let rebased = {
            let mut proposals = self.proposals.lock();
            if message.source.is_authority() && proposals.has_pending(&remote.state_type) {
                proposals.rebase(&remote.state_type, remote.value.clone());
                true
            } else {
                false
            }
        };
        if rebased {
            return;
        }

        let (outcome, value) = {
            let mut store = self.store.write();
            let outcome = store.reconcile(remote, &policy);
            (outcome, store.value(&payload.state_type).cloned())
        };
        if outcome.changed() {
            self.notify(StateChange {
                state_type: payload.state_type,
                value,
                outcome,
                origin: message.origin().to_string(),
            });
        } else {
            tracing::debug!(message_id = %message.id, ?outcome, "remote state not applied");
        }
    }

    fn handle_request(&self, message: &RuntimeMessage) {
        let Some(state_type) = message.payload.get("stateType").and_then(Value::as_str) else {
            return;
        };
        let scope = message.scope.unwrap_or(SyncScope::Device);
        let policy = self.policy(state_type);
        if !should_sync_state(&policy, scope) {
            return;
        }
        let Some(value) = self.get(state_type) else {
            return;
        };
        let payload = json!({
            "stateType": state_type,
            "state": filter_for_sync(&value, &policy),
            "timestamp": self.store.read().get(state_type).map(|e| e.updated_at).unwrap_or_default(),
        });
        self.dispatcher.dispatch(
            DispatchRequest::new(message.reply_to(types::STATE_RESPONSE, payload))
                .with_policy_key(policy_key(state_type))
                .with_scope(scope)
                .unthrottled(),
        );
    }

    fn handle_conflict(&self, message: &RuntimeMessage) {
        if !message.source.is_authority() {
            tracing::debug!(message_id = %message.id, "state conflict from non-authority");
            return;
        }
        let Some(op_id) = &message.response_to_id else {
            return;
        };
        if let Err(e) = self.reject(op_id) {
            tracing::debug!("conflict ignored: {}", e);
        }
    }
}

impl Drop for StateSync {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.lock().take() {
            self.dispatcher.unsubscribe(&subscription);
        }
    }
}

fn policy_key(state_type: &str) -> String {
    format!("state:{}", state_type)
}

fn parse_payload(message: &RuntimeMessage) -> Option<StatePayload> {
    match serde_json::from_value(message.payload.clone()) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!(message_id = %message.id, "bad state payload: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tabmesh_core::{Identity, ManualClock};
    use tabmesh_policy::PolicyRegistry;
    use tabmesh_runtime::DispatcherConfig;
    use tabmesh_wire::{create_message, MessageSource, MessageTarget};

    use crate::StateError;

    fn dispatcher(clock: Arc<ManualClock>) -> Arc<Dispatcher> {
        Dispatcher::new(
            Identity::new("dev1".into(), "tabA".into(), "ses".into()),
            clock,
            Arc::new(PolicyRegistry::new()),
            DispatcherConfig::default(),
        )
    }

    fn outbound(dispatcher: &Dispatcher) -> Arc<Mutex<Vec<RuntimeMessage>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.subscribe(Channel::State, move |m| {
            if m.identity.tab_id.as_str() == "tabA" {
                sink.lock().push(m.clone());
            }
        });
        seen
    }

    fn deliver(d: &Dispatcher, params: MessageParams, from: &str, sent_at: u64) {
        let message = create_message(params, &Identity::new("dev1".into(), from.into(), "ses".into()), sent_at);
        d.handle_inbound("local_bus", &message.encode().unwrap());
    }

    fn update(state_type: &str, state: Value, timestamp: u64, scope: SyncScope) -> MessageParams {
        MessageParams::new(Channel::State, types::STATE_UPDATE)
            .with_payload(json!({"stateType": state_type, "state": state, "timestamp": timestamp}))
            .with_scope(scope)
    }

    #[test]
    fn test_publish_strips_private_fields() {
        let d = dispatcher(ManualClock::shared(10));
        let sent = outbound(&d);
        let sync = StateSync::new(Arc::clone(&d));

        let session = json!({"user": "ana", "accessToken": "s3cret"});
        assert_eq!(sync.publish("session", &session, SyncScope::Device), Published::Sent);

        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type, types::STATE_UPDATE);
        assert_eq!(sent[0].payload["state"], json!({"user": "ana"}));
        assert_eq!(sent[0].scope, Some(SyncScope::Device));
        // The local copy keeps everything
        assert_eq!(sync.get("session"), Some(session));
    }

    #[test]
    fn test_publish_beyond_scope_not_shared() {
        let d = dispatcher(ManualClock::shared(10));
        let sent = outbound(&d);
        let sync = StateSync::new(Arc::clone(&d));

        assert_eq!(
            sync.publish("session", &json!({"user": "ana"}), SyncScope::User),
            Published::NotShared
        );
        assert_eq!(sync.publish("unknown", &json!(1), SyncScope::Local), Published::NotShared);
        assert!(sent.lock().is_empty());
        assert_eq!(sync.state_types(), vec!["session".to_string(), "unknown".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_state_coalesced() {
        let d = dispatcher(ManualClock::shared(10));
        let sent = outbound(&d);
        let sync = StateSync::new(Arc::clone(&d));

        for i in 0..4 {
            let published = sync.publish("canvas", &json!({"nodes": [i]}), SyncScope::Canvas);
            assert_eq!(published, if i == 0 { Published::Sent } else { Published::Deferred });
        }
        assert_eq!(sent.lock().len(), 1);

        tokio::time::sleep(Duration::from_millis(110)).await;
        let sent = sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].payload["state"], json!({"nodes": [3]}));
    }

    #[test]
    fn test_inbound_update_reconciled() {
        let clock = ManualClock::shared(100);
        let d = dispatcher(clock.clone());
        let sync = StateSync::new(Arc::clone(&d));
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        sync.on_change(move |c| sink.lock().push(c.clone()));

        sync.publish("user_preferences", &json!({"theme": "dark"}), SyncScope::Local);
        deliver(&d, update("user_preferences", json!({"theme": "light"}), 50, SyncScope::User), "tabB", 50);
        assert_eq!(sync.get("user_preferences"), Some(json!({"theme": "dark"})));
        assert!(changes.lock().is_empty());

        deliver(&d, update("user_preferences", json!({"theme": "light"}), 200, SyncScope::User), "tabB", 100);
        assert_eq!(sync.get("user_preferences"), Some(json!({"theme": "light"})));

        let changes = changes.lock();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].outcome, ApplyOutcome::Replaced);
        assert_eq!(changes[0].origin, "tabB");
    }

    #[test]
    fn test_inbound_beyond_policy_scope_dropped() {
        let d = dispatcher(ManualClock::shared(100));
        let sync = StateSync::new(Arc::clone(&d));

        deliver(&d, update("session", json!({"user": "eve"}), 100, SyncScope::Canvas), "tabB", 100);
        assert_eq!(sync.get("session"), None);
    }

    #[test]
    fn test_request_answered_with_filtered_state() {
        let d = dispatcher(ManualClock::shared(100));
        let sent = outbound(&d);
        let sync = StateSync::new(Arc::clone(&d));
        sync.publish("session", &json!({"user": "ana", "refreshToken": "x"}), SyncScope::Local);

        let request = MessageParams::new(Channel::State, types::STATE_REQUEST)
            .with_payload(json!({"stateType": "session"}))
            .with_scope(SyncScope::Device)
            .as_request();
        deliver(&d, request, "tabB", 100);

        let sent = sent.lock();
        let response = sent.last().unwrap();
        assert_eq!(response.message_type, types::STATE_RESPONSE);
        assert_eq!(response.target, MessageTarget::Specific);
        assert_eq!(response.target_id.as_deref(), Some("tabB"));
        assert_eq!(response.payload["state"], json!({"user": "ana"}));
    }

    fn from_server(params: MessageParams, response_to: &str) -> MessageParams {
        let mut params = params.from_source(MessageSource::Server);
        params.response_to_id = Some(response_to.to_string());
        params
    }

    #[test]
    fn test_proposal_committed_by_authority() {
        let d = dispatcher(ManualClock::shared(100));
        let sent = outbound(&d);
        let sync = StateSync::new(Arc::clone(&d));

        let step = json!({"step": 2});
        assert_eq!(sync.propose("op1", "pipeline", &step, SyncScope::User), Ok(Published::Sent));
        assert_eq!(sent.lock()[0].request_id.as_deref(), Some("op1"));
        assert_eq!(sync.pending_proposals(), 1);

        let response = MessageParams::new(Channel::State, types::STATE_RESPONSE)
            .with_payload(json!({"stateType": "pipeline", "state": step, "timestamp": 150}))
            .with_scope(SyncScope::User);
        deliver(&d, from_server(response, "op1"), "server", 150);

        assert_eq!(sync.pending_proposals(), 0);
        assert_eq!(sync.get("pipeline"), Some(json!({"step": 2})));
    }

    #[test]
    fn test_proposal_rolled_back_on_conflict() {
        let d = dispatcher(ManualClock::shared(100));
        let sync = StateSync::new(Arc::clone(&d));
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        sync.on_change(move |c| sink.lock().push(c.clone()));

        sync.publish("pipeline", &json!({"step": 1}), SyncScope::Local);
        sync.propose("op1", "pipeline", &json!({"step": 2}), SyncScope::User).unwrap();
        sync.propose("op2", "pipeline", &json!({"step": 3}), SyncScope::User).unwrap();

        let conflict = MessageParams::new(Channel::State, types::STATE_CONFLICT)
            .with_payload(json!({"stateType": "pipeline"}))
            .with_scope(SyncScope::User);
        deliver(&d, from_server(conflict.clone(), "op2"), "server", 100);
        assert_eq!(sync.get("pipeline"), Some(json!({"step": 2})));

        deliver(&d, from_server(conflict, "op1"), "server", 100);
        assert_eq!(sync.get("pipeline"), Some(json!({"step": 1})));
        assert_eq!(changes.lock().len(), 2);
        assert!(changes.lock().iter().all(|c| c.outcome == ApplyOutcome::RolledBack));
    }

    #[test]
    fn test_unshared_proposal_commits_at_once() {
        let d = dispatcher(ManualClock::shared(100));
        let sync = StateSync::new(Arc::clone(&d));

        let published = sync.propose("op1", "selection", &json!(["n1"]), SyncScope::Device);
        assert_eq!(published, Ok(Published::NotShared));
        assert_eq!(sync.pending_proposals(), 0);
        assert_eq!(
            sync.propose("op1", "selection", &json!([]), SyncScope::Local),
            Err(StateError::DuplicateOp("op1".into()))
        );
    }
}
