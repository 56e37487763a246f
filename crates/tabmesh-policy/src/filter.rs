//! State sync gating and privacy filtering

use serde_json::Value;

use tabmesh_core::SyncScope;

use crate::{PolicyRegistry, StateSyncPolicy};

/// Does `policy` allow syncing to `target_scope`?
///
/// True only for enabled policies and targets no broader than the policy's scope.
pub fn should_sync_state(policy: &StateSyncPolicy, target_scope: SyncScope) -> bool {
    policy.enabled && policy.scope.covers(target_scope)
}

/// Strip `exclude_fields` from a state object
///
/// Must run before serialization for any transport send. Non-object values
/// carry no named fields and pass through unchanged.
pub fn filter_for_sync(state: &Value, policy: &StateSyncPolicy) -> Value {
    match state {
        Value::Object(map) if !policy.exclude_fields.is_empty() => Value::Object(
            map.iter()
                .filter(|(key, _)| !policy.exclude_fields.iter().any(|f| f == *key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

impl PolicyRegistry {
    pub fn should_sync_state(&self, state_type: &str, target_scope: SyncScope) -> bool {
        should_sync_state(&self.resolve_state_policy(state_type), target_scope)
    }

    pub fn filter_for_sync(&self, state: &Value, state_type: &str) -> Value {
        filter_for_sync(state, &self.resolve_state_policy(state_type))
    }
}
