//! Policy definitions

use serde::{Deserialize, Serialize};

use tabmesh_core::SyncScope;

/// Sharing rule for one event type
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSyncPolicy {
    pub sync_across_tabs: bool,
    pub sync_across_devices: bool,
    pub sync_to_canvas_users: bool,
    /// At most one send per window; 0 disables throttling
    pub throttle_ms: u64,
    pub batchable: bool,
    pub priority: i32,
}

impl EventSyncPolicy {
    pub const fn new(tabs: bool, devices: bool, canvas: bool, throttle_ms: u64) -> Self {
        EventSyncPolicy {
            sync_across_tabs: tabs,
            sync_across_devices: devices,
            sync_to_canvas_users: canvas,
            throttle_ms,
            batchable: false,
            priority: 0,
        }
    }

    /// Fallback for unmatched types: tabs only, no throttle
    pub const fn fallback() -> Self {
        Self::new(true, false, false, 0)
    }

    /// Never leaves the context
    pub const fn local_only() -> Self {
        Self::new(false, false, false, 0)
    }

    pub fn as_batchable(mut self) -> Self {
        self.batchable = true;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Broadest scope this policy reaches
    ///
    /// Canvas beats devices beats tabs; no flag set means local.
    pub fn target_scope(&self) -> SyncScope {
        if self.sync_to_canvas_users {
            SyncScope::Canvas
        } else if self.sync_across_devices {
            SyncScope::User
        } else if self.sync_across_tabs {
            SyncScope::Device
        } else {
            SyncScope::Local
        }
    }

    #[inline]
    pub fn is_throttled(&self) -> bool {
        self.throttle_ms > 0
    }
}

/// Target scope for an outbound event governed by `policy`
pub fn resolve_event_scope(policy: &EventSyncPolicy) -> SyncScope {
    policy.target_scope()
}

impl Default for EventSyncPolicy {
    fn default() -> Self {
        Self::fallback()
    }
}

/// How a remote state update is reconciled with local state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Newer timestamp wins
    #[default]
    LastWriteWins,
    /// Shallow merge of `merge_fields` (all fields when empty)
    Merge,
    /// Remote updates are ignored
    DiscardRemote,
    /// Only hub/server updates are applied
    ServerAuthority,
}

/// Sharing rule for one state type
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSyncPolicy {
    pub enabled: bool,
    pub scope: SyncScope,
    pub conflict_strategy: ConflictStrategy,
    pub throttle_ms: u64,
    pub worker_authority: bool,
    /// Fields never sent off this context (e.g. session tokens)
    #[serde(default)]
    pub exclude_fields: Vec<String>,
    #[serde(default)]
    pub merge_fields: Vec<String>,
}

impl StateSyncPolicy {
    pub fn new(scope: SyncScope, conflict_strategy: ConflictStrategy) -> Self {
        StateSyncPolicy {
            enabled: true,
            scope,
            conflict_strategy,
            throttle_ms: 0,
            worker_authority: false,
            exclude_fields: Vec::new(),
            merge_fields: Vec::new(),
        }
    }

    /// Fallback for unknown state types: never synced
    pub fn disabled() -> Self {
        StateSyncPolicy {
            enabled: false,
            ..Self::new(SyncScope::Local, ConflictStrategy::DiscardRemote)
        }
    }

    pub fn with_throttle(mut self, throttle_ms: u64) -> Self {
        self.throttle_ms = throttle_ms;
        self
    }

    pub fn with_worker_authority(mut self) -> Self {
        self.worker_authority = true;
        self
    }

    pub fn excluding<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn merging<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.merge_fields.extend(fields.into_iter().map(Into::into));
        self
    }
}

impl Default for StateSyncPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}
