//! Local state store and remote reconciliation

use std::collections::HashMap;

use serde_json::Value;

use tabmesh_policy::{ConflictStrategy, StateSyncPolicy};
use tabmesh_wire::MessageSource;

/// Current value of one state type
#[derive(Clone, Debug, PartialEq)]
pub struct StateEntry {
    pub value: Value,
    /// Writer's timestamp of the winning update (ms)
    pub updated_at: u64,
    /// Context id of the writer
    pub origin: String,
    pub source: MessageSource,
}

/// A state update received from another context
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteState {
    pub state_type: String,
    pub value: Value,
    pub timestamp: u64,
    pub origin: String,
    pub source: MessageSource,
}

/// What reconciliation did with an update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Replaced,
    Merged,
    /// Older than the local value
    Stale,
    /// Policy discards remote updates
    Discarded,
    /// Non-authority write to authority-owned state
    Unauthorized,
    /// State type is not synced
    Disabled,
    /// A tentative local write was undone
    RolledBack,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        matches!(
            self,
            ApplyOutcome::Inserted
                | ApplyOutcome::Replaced
                | ApplyOutcome::Merged
                | ApplyOutcome::RolledBack
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct StateStore {
    entries: HashMap<String, StateEntry>,
}

impl StateStore {
    pub fn new() -> Self {
        StateStore::default()
    }

    pub fn get(&self, state_type: &str) -> Option<&StateEntry> {
        self.entries.get(state_type)
    }

    pub fn value(&self, state_type: &str) -> Option<&Value> {
        self.entries.get(state_type).map(|e| &e.value)
    }

    /// Record a local write unconditionally
    pub fn set_local(&mut self, state_type: &str, value: Value, now_ms: u64, origin: &str) {
        self.entries.insert(
            state_type.to_string(),
            StateEntry {
                value,
                updated_at: now_ms,
                origin: origin.to_string(),
                source: MessageSource::Tab,
            },
        );
    }

    pub fn remove(&mut self, state_type: &str) -> Option<StateEntry> {
        self.entries.remove(state_type)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StateEntry)> {
        self.entries.iter()
    }

    /// Reconcile a remote update under `policy`
    ///
    /// Fields the policy excludes from sync never arrive from peers, so any
    /// local copy of them survives a replace or merge.
    pub fn reconcile(&mut self, remote: RemoteState, policy: &StateSyncPolicy) -> ApplyOutcome {
        if !policy.enabled {
            return ApplyOutcome::Disabled;
        }
        match policy.conflict_strategy {
            ConflictStrategy::DiscardRemote => ApplyOutcome::Discarded,
            ConflictStrategy::ServerAuthority if policy.worker_authority => {
                if remote.source.is_authority() {
                    self.replace(remote, policy)
                } else {
                    ApplyOutcome::Unauthorized
                }
            }
            ConflictStrategy::ServerAuthority | ConflictStrategy::LastWriteWins => {
                self.last_write_wins(remote, policy)
            }
            ConflictStrategy::Merge => self.merge(remote, policy),
        }
    }

    fn last_write_wins(&mut self, remote: RemoteState, policy: &StateSyncPolicy) -> ApplyOutcome {
        match self.entries.get(&remote.state_type) {
            Some(local) if !is_newer(&remote, local) => ApplyOutcome::Stale,
            _ => self.replace(remote, policy),
        }
    }

    fn replace(&mut self, remote: RemoteState, policy: &StateSyncPolicy) -> ApplyOutcome {
        let previous = self.entries.get(&remote.state_type);
        let outcome = if previous.is_some() {
            ApplyOutcome::Replaced
        } else {
            ApplyOutcome::Inserted
        };
        let value = match previous {
            Some(local) => keep_private_fields(&local.value, remote.value, policy),
            None => remote.value,
        };
        self.entries.insert(
            remote.state_type,
            StateEntry {
                value,
                updated_at: remote.timestamp,
                origin: remote.origin,
                source: remote.source,
            },
        );
        outcome
    }

    fn merge(&mut self, remote: RemoteState, policy: &StateSyncPolicy) -> ApplyOutcome {
        if let Some(StateEntry {
            value: Value::Object(target),
            updated_at,
            origin,
            source,
        }) = self.entries.get_mut(&remote.state_type)
        {
            if let Value::Object(incoming) = &remote.value {
                for (key, value) in incoming {
                    if policy.merge_fields.is_empty() || policy.merge_fields.iter().any(|f| f == key) {
                        target.insert(key.clone(), value.clone());
                    }
                }
                if remote.timestamp >= *updated_at {
                    *updated_at = remote.timestamp;
                    *origin = remote.origin.clone();
                    *source = remote.source;
                }
                return ApplyOutcome::Merged;
            }
        }
        // Non-object values have no fields to merge
        self.last_write_wins(remote, policy)
    }
}

/// Timestamp order with the writer id breaking ties
fn is_newer(remote: &RemoteState, local: &StateEntry) -> bool {
    (remote.timestamp, remote.origin.as_str()) > (local.updated_at, local.origin.as_str())
}

fn keep_private_fields(local: &Value, incoming: Value, policy: &StateSyncPolicy) -> Value {
    match (local, incoming) {
        (Value::Object(local), Value::Object(mut incoming)) if !policy.exclude_fields.is_empty() => {
            for field in &policy.exclude_fields {
                if let Some(value) = local.get(field) {
                    incoming.insert(field.clone(), value.clone());
                }
            }
            Value::Object(incoming)
        }
        (_, incoming) => incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabmesh_core::SyncScope;

    fn remote(state_type: &str, value: Value, timestamp: u64, origin: &str) -> RemoteState {
        RemoteState {
            state_type: state_type.to_string(),
            value,
            timestamp,
            origin: origin.to_string(),
            source: MessageSource::Tab,
        }
    }

    fn lww() -> StateSyncPolicy {
        StateSyncPolicy::new(SyncScope::Device, ConflictStrategy::LastWriteWins)
    }

    #[test]
    fn test_last_write_wins() {
        let mut store = StateStore::new();
        store.set_local("prefs", json!({"theme": "dark"}), 100, "tabA");

        let outcome = store.reconcile(remote("prefs", json!({"theme": "light"}), 99, "tabB"), &lww());
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(store.value("prefs"), Some(&json!({"theme": "dark"})));

        let outcome = store.reconcile(remote("prefs", json!({"theme": "light"}), 150, "tabB"), &lww());
        assert_eq!(outcome, ApplyOutcome::Replaced);
        assert_eq!(store.get("prefs").unwrap().origin, "tabB");
    }

    #[test]
    fn test_equal_timestamps_break_on_origin() {
        let mut store = StateStore::new();
        store.set_local("prefs", json!(1), 100, "tabB");

        assert_eq!(
            store.reconcile(remote("prefs", json!(2), 100, "tabA"), &lww()),
            ApplyOutcome::Stale
        );
        assert_eq!(
            store.reconcile(remote("prefs", json!(3), 100, "tabC"), &lww()),
            ApplyOutcome::Replaced
        );
    }

    #[test]
    fn test_merge_selected_fields() {
        let policy = StateSyncPolicy::new(SyncScope::Canvas, ConflictStrategy::Merge)
            .merging(["nodes", "viewport"]);
        let mut store = StateStore::new();
        store.set_local("canvas", json!({"nodes": [1], "title": "mine"}), 100, "tabA");

        let incoming = json!({"nodes": [1, 2], "title": "theirs", "viewport": {"zoom": 2}});
        let outcome = store.reconcile(remote("canvas", incoming, 50, "tabB"), &policy);

        assert_eq!(outcome, ApplyOutcome::Merged);
        assert_eq!(
            store.value("canvas"),
            Some(&json!({"nodes": [1, 2], "title": "mine", "viewport": {"zoom": 2}}))
        );
        assert_eq!(store.get("canvas").unwrap().updated_at, 100);
    }

    #[test]
    fn test_merge_all_fields_when_unlisted() {
        let policy = StateSyncPolicy::new(SyncScope::Device, ConflictStrategy::Merge);
        let mut store = StateStore::new();
        store.set_local("ui_layout", json!({"left": 200}), 1, "tabA");

        store.reconcile(remote("ui_layout", json!({"right": 300}), 2, "tabB"), &policy);
        assert_eq!(store.value("ui_layout"), Some(&json!({"left": 200, "right": 300})));
    }

    #[test]
    fn test_discard_and_disabled() {
        let mut store = StateStore::new();
        let discard = StateSyncPolicy::new(SyncScope::Local, ConflictStrategy::DiscardRemote);
        assert_eq!(
            store.reconcile(remote("selection", json!([1]), 1, "tabB"), &discard),
            ApplyOutcome::Discarded
        );
        assert_eq!(
            store.reconcile(remote("other", json!(1), 1, "tabB"), &StateSyncPolicy::disabled()),
            ApplyOutcome::Disabled
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_server_authority() {
        let policy = StateSyncPolicy::new(SyncScope::User, ConflictStrategy::ServerAuthority)
            .with_worker_authority();
        let mut store = StateStore::new();
        store.set_local("pipeline", json!({"step": 1}), 500, "tabA");

        let from_tab = remote("pipeline", json!({"step": 9}), 900, "tabB");
        assert_eq!(store.reconcile(from_tab, &policy), ApplyOutcome::Unauthorized);

        let mut from_server = remote("pipeline", json!({"step": 2}), 10, "server");
        from_server.source = MessageSource::Server;
        assert_eq!(store.reconcile(from_server, &policy), ApplyOutcome::Replaced);
        assert_eq!(store.value("pipeline"), Some(&json!({"step": 2})));
    }

    #[test]
    fn test_private_fields_survive_replace() {
        let policy = lww().excluding(["accessToken"]);
        let mut store = StateStore::new();
        store.set_local("session", json!({"user": "ana", "accessToken": "s3cret"}), 1, "tabA");

        store.reconcile(remote("session", json!({"user": "bea"}), 2, "tabB"), &policy);
        assert_eq!(
            store.value("session"),
            Some(&json!({"user": "bea", "accessToken": "s3cret"}))
        );
    }
}
