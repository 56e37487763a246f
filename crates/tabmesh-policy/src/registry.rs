//! Policy registry with runtime overrides

use parking_lot::RwLock;

use tabmesh_core::MeshResult;

use crate::{
    builtin_event_policies, builtin_state_policies, EventPattern, EventSyncPolicy, PolicyTable,
    StateSyncPolicy,
};

/// Resolves policies for event and state types
///
/// Resolution order: custom exact, custom namespace, built-in exact,
/// built-in namespace, default.
#[derive(Debug)]
pub struct PolicyRegistry {
    builtin_events: PolicyTable<EventSyncPolicy>,
    builtin_states: PolicyTable<StateSyncPolicy>,
    custom_events: RwLock<PolicyTable<EventSyncPolicy>>,
    custom_states: RwLock<PolicyTable<StateSyncPolicy>>,
}

impl PolicyRegistry {
    /// Registry seeded with the built-in tables
    pub fn new() -> Self {
        Self::with_tables(builtin_event_policies(), builtin_state_policies())
    }

    /// Registry with no built-ins; everything falls back to defaults
    pub fn empty() -> Self {
        Self::with_tables(PolicyTable::new(), PolicyTable::new())
    }

    pub fn with_tables(
        events: PolicyTable<EventSyncPolicy>,
        states: PolicyTable<StateSyncPolicy>,
    ) -> Self {
        PolicyRegistry {
            builtin_events: events,
            builtin_states: states,
            custom_events: RwLock::new(PolicyTable::new()),
            custom_states: RwLock::new(PolicyTable::new()),
        }
    }

    /// Register an event policy for `pattern` (`type` or `namespace:*`)
    pub fn register_event_policy(&self, pattern: &str, policy: EventSyncPolicy) -> MeshResult<()> {
        let pattern = EventPattern::parse(pattern)?;
        tracing::debug!(%pattern, "registered event policy");
        self.custom_events.write().insert(pattern, policy);
        Ok(())
    }

    pub fn unregister_event_policy(&self, pattern: &str) -> MeshResult<Option<EventSyncPolicy>> {
        let pattern = EventPattern::parse(pattern)?;
        Ok(self.custom_events.write().remove(&pattern))
    }

    pub fn register_state_policy(&self, pattern: &str, policy: StateSyncPolicy) -> MeshResult<()> {
        let pattern = EventPattern::parse(pattern)?;
        tracing::debug!(%pattern, "registered state policy");
        self.custom_states.write().insert(pattern, policy);
        Ok(())
    }

    pub fn unregister_state_policy(&self, pattern: &str) -> MeshResult<Option<StateSyncPolicy>> {
        let pattern = EventPattern::parse(pattern)?;
        Ok(self.custom_states.write().remove(&pattern))
    }

    pub fn resolve_event_policy(&self, event_type: &str) -> EventSyncPolicy {
        if let Some(policy) = self.custom_events.read().lookup(event_type) {
            return policy.clone();
        }
        self.builtin_events
            .lookup(event_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn resolve_state_policy(&self, state_type: &str) -> StateSyncPolicy {
        if let Some(policy) = self.custom_states.read().lookup(state_type) {
            return policy.clone();
        }
        self.builtin_states
            .lookup(state_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn builtin_state_policies(&self) -> &PolicyTable<StateSyncPolicy> {
        &self.builtin_states
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabmesh_core::SyncScope;

    #[test]
    fn test_resolve_builtin_and_default() {
        let registry = PolicyRegistry::new();
        assert_eq!(registry.resolve_event_policy("cursor:move").throttle_ms, 50);
        assert_eq!(
            registry.resolve_event_policy("unknown:thing"),
            EventSyncPolicy::fallback()
        );
        assert!(!registry.resolve_state_policy("nope").enabled);
    }

    #[test]
    fn test_custom_overrides_builtin() {
        let registry = PolicyRegistry::new();
        registry
            .register_event_policy("cursor:move", EventSyncPolicy::local_only())
            .unwrap();
        assert_eq!(
            registry.resolve_event_policy("cursor:move").target_scope(),
            SyncScope::Local
        );

        registry.unregister_event_policy("cursor:move").unwrap();
        assert_eq!(registry.resolve_event_policy("cursor:move").throttle_ms, 50);
    }

    #[test]
    fn test_custom_wildcard_outranks_builtin_exact() {
        let registry = PolicyRegistry::new();
        registry
            .register_event_policy("cursor:*", EventSyncPolicy::new(true, true, true, 10))
            .unwrap();
        assert_eq!(registry.resolve_event_policy("cursor:move").throttle_ms, 10);
    }

    #[test]
    fn test_custom_exact_beats_custom_wildcard() {
        let registry = PolicyRegistry::empty();
        registry
            .register_event_policy("doc:*", EventSyncPolicy::new(true, false, false, 0))
            .unwrap();
        registry
            .register_event_policy("doc:save", EventSyncPolicy::new(true, true, false, 0))
            .unwrap();

        assert_eq!(registry.resolve_event_policy("doc:save").target_scope(), SyncScope::User);
        assert_eq!(registry.resolve_event_policy("doc:open").target_scope(), SyncScope::Device);
    }

    #[test]
    fn test_custom_state_policy() {
        let registry = PolicyRegistry::new();
        registry
            .register_state_policy(
                "board",
                StateSyncPolicy::new(SyncScope::Canvas, crate::ConflictStrategy::Merge),
            )
            .unwrap();
        assert_eq!(registry.resolve_state_policy("board").scope, SyncScope::Canvas);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let registry = PolicyRegistry::new();
        assert!(registry
            .register_event_policy("bad*pattern", EventSyncPolicy::fallback())
            .is_err());
    }
}
