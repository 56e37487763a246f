//! Built-in policy tables

use tabmesh_core::SyncScope;

use crate::{ConflictStrategy, EventPattern, EventSyncPolicy, PolicyTable, StateSyncPolicy};

/// Default event policies
///
/// | pattern            | tabs | devices | canvas | throttle |
/// |--------------------|------|---------|--------|----------|
/// | `cursor:move`      |  -   |    -    |   x    |  50ms    |
/// | `cursor:hide`      |  -   |    -    |   x    |   -      |
/// | `selection:change` |  x   |    -    |   x    | 100ms    |
/// | `presence:*`       |  x   |    x    |   x    | 100ms    |
/// | `canvas:*`         |  x   |    x    |   x    |   -      |
/// | `widget:*`         |  x   |    -    |   x    |   -      |
/// | `pipeline:*`       |  x   |    x    |   -    |   -      |
/// | `state:*`          |  x   |    x    |   -    |   -      |
/// | `permission:*`     |  x   |    x    |   -    |   -      |
/// | `ai:*`             |  x   |    -    |   -    |   -      |
/// | `system:*`         |  x   |    -    |   -    |   -      |
/// | `debug:*`          |  -   |    -    |   -    |   -      |
pub fn builtin_event_policies() -> PolicyTable<EventSyncPolicy> {
    PolicyTable::new()
        .with(
            EventPattern::exact("cursor:move"),
            EventSyncPolicy::new(false, false, true, 50).with_priority(1),
        )
        .with(
            EventPattern::exact("cursor:hide"),
            EventSyncPolicy::new(false, false, true, 0).with_priority(1),
        )
        .with(
            EventPattern::exact("selection:change"),
            EventSyncPolicy::new(true, false, true, 100),
        )
        .with(
            EventPattern::namespace("presence"),
            EventSyncPolicy::new(true, true, true, 100).with_priority(2),
        )
        .with(
            EventPattern::namespace("canvas"),
            EventSyncPolicy::new(true, true, true, 0).as_batchable(),
        )
        .with(
            EventPattern::namespace("widget"),
            EventSyncPolicy::new(true, false, true, 0).as_batchable(),
        )
        .with(
            EventPattern::namespace("pipeline"),
            EventSyncPolicy::new(true, true, false, 0),
        )
        .with(
            EventPattern::namespace("state"),
            EventSyncPolicy::new(true, true, false, 0),
        )
        .with(
            EventPattern::namespace("permission"),
            EventSyncPolicy::new(true, true, false, 0).with_priority(3),
        )
        .with(
            EventPattern::namespace("ai"),
            EventSyncPolicy::new(true, false, false, 0),
        )
        .with(
            EventPattern::namespace("system"),
            EventSyncPolicy::new(true, false, false, 0).with_priority(2),
        )
        .with(
            EventPattern::namespace("debug"),
            EventSyncPolicy::local_only(),
        )
}

/// Default state policies
pub fn builtin_state_policies() -> PolicyTable<StateSyncPolicy> {
    PolicyTable::new()
        .with(
            EventPattern::exact("canvas"),
            StateSyncPolicy::new(SyncScope::Canvas, ConflictStrategy::Merge)
                .merging(["nodes", "edges", "viewport"])
                .with_throttle(100),
        )
        .with(
            EventPattern::exact("widgets"),
            StateSyncPolicy::new(SyncScope::Canvas, ConflictStrategy::LastWriteWins)
                .excluding(["localCache"]),
        )
        .with(
            EventPattern::exact("pipeline"),
            StateSyncPolicy::new(SyncScope::User, ConflictStrategy::ServerAuthority)
                .with_worker_authority(),
        )
        .with(
            EventPattern::exact("user_preferences"),
            StateSyncPolicy::new(SyncScope::User, ConflictStrategy::LastWriteWins)
                .excluding(["deviceOverrides"]),
        )
        .with(
            EventPattern::exact("session"),
            StateSyncPolicy::new(SyncScope::Device, ConflictStrategy::LastWriteWins)
                .excluding(["accessToken", "refreshToken", "sessionToken"]),
        )
        .with(
            EventPattern::exact("ui_layout"),
            StateSyncPolicy::new(SyncScope::Device, ConflictStrategy::Merge),
        )
        .with(
            EventPattern::exact("selection"),
            StateSyncPolicy::new(SyncScope::Local, ConflictStrategy::DiscardRemote),
        )
}
