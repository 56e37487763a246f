//! Presence manager
//!
//! Tracks the local participant and merges remote entries from three
//! sources: hub tab join/leave (same device), presence messages from other
//! tabs, and the network presence feed.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use tabmesh_core::SyncScope;
use tabmesh_runtime::{DispatchRequest, Dispatcher, Subscription, SyncContext, Throttle};
use tabmesh_transport::{NetworkTransport, RemotePresence, TabEvent, TabInfo, Transport};
use tabmesh_wire::{types, Channel, MessageParams, RuntimeMessage};

use crate::{
    ActivityTracker, CursorPosition, CursorTrack, PresenceEntry, PresenceStatus, Selection,
    DEFAULT_EXTRAPOLATION,
};

const CURSOR_KEY: &str = "cursor:move";
const ENTRY_KEY: &str = "presence:update";

/// Presence timing
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PresenceConfig {
    pub idle_timeout_ms: u64,
    pub away_timeout_ms: u64,
    pub stale_timeout_ms: u64,
    pub cleanup_interval_ms: u64,
    pub activity_check_interval_ms: u64,
    pub cursor_throttle_ms: u64,
    /// Coalescing window for local entry broadcasts
    pub entry_throttle_ms: u64,
    pub extrapolation: f64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        PresenceConfig {
            idle_timeout_ms: 60_000,
            away_timeout_ms: 300_000,
            stale_timeout_ms: 30_000,
            cleanup_interval_ms: 10_000,
            activity_check_interval_ms: 5_000,
            cursor_throttle_ms: 50,
            entry_throttle_ms: 100,
            extrapolation: DEFAULT_EXTRAPOLATION,
        }
    }
}

/// Change notification
#[derive(Clone, Debug, PartialEq)]
pub enum PresenceChange {
    Upserted(PresenceEntry),
    Removed(String),
    LocalStatus(PresenceStatus),
}

pub type PresenceChangeHandler = Arc<dyn Fn(&PresenceChange) + Send + Sync>;

enum Outgoing {
    Cursor(CursorPosition),
    Entry(PresenceEntry),
}

struct Tracked {
    entry: PresenceEntry,
    track: Option<CursorTrack>,
    /// Announced by the hub; only a hub leave removes it
    pinned: bool,
}

impl Tracked {
    fn new(entry: PresenceEntry) -> Self {
        Tracked {
            entry,
            track: None,
            pinned: false,
        }
    }
}

struct Local {
    entry: PresenceEntry,
    activity: ActivityTracker,
}

pub struct PresenceManager {
    config: PresenceConfig,
    dispatcher: Arc<Dispatcher>,
    network: RwLock<Option<NetworkTransport>>,
    local: Mutex<Local>,
    remote: RwLock<HashMap<String, Tracked>>,
    outgoing: Throttle<Outgoing>,
    on_change: RwLock<Option<PresenceChangeHandler>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl PresenceManager {
    /// Manager fed only by dispatcher messages
    pub fn new(dispatcher: Arc<Dispatcher>, config: PresenceConfig) -> Arc<Self> {
        let now = dispatcher.clock().now_ms();
        let entry = PresenceEntry::from_identity(dispatcher.identity(), now);
        let activity = ActivityTracker::new(config.idle_timeout_ms, config.away_timeout_ms, now);

        let manager = Arc::new_cyclic(|me: &Weak<PresenceManager>| {
            let sink = me.clone();
            PresenceManager {
                config,
                dispatcher: Arc::clone(&dispatcher),
                network: RwLock::new(None),
                local: Mutex::new(Local { entry, activity }),
                remote: RwLock::new(HashMap::new()),
                outgoing: Throttle::new(move |_: &str, item: Outgoing| {
                    if let Some(manager) = sink.upgrade() {
                        manager.send(item);
                    }
                }),
                on_change: RwLock::new(None),
                subscriptions: Mutex::new(Vec::new()),
            }
        });

        let mut subscriptions = Vec::new();
        for channel in [Channel::Presence, Channel::Cursor] {
            let weak = Arc::downgrade(&manager);
            subscriptions.push(dispatcher.subscribe(channel, move |message| {
                if let Some(manager) = weak.upgrade() {
                    manager.handle_message(message);
                }
            }));
        }
        *manager.subscriptions.lock() = subscriptions;
        manager
    }

    /// Manager wired to every presence source of `context`
    pub fn attach(context: &SyncContext, config: PresenceConfig) -> Arc<Self> {
        let manager = Self::new(Arc::clone(context.dispatcher()), config);

        if let Some(hub) = context.hub() {
            let weak = Arc::downgrade(&manager);
            hub.on_tab_event(Arc::new(move |event| {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                match event {
                    TabEvent::Joined(tab) => manager.apply_tab_joined(&tab),
                    TabEvent::Left(tab_id) => manager.apply_tab_left(&tab_id),
                }
            }));
        }

        if let Some(network) = context.network() {
            let weak = Arc::downgrade(&manager);
            network.on_presence(Arc::new(move |presence| {
                if let Some(manager) = weak.upgrade() {
                    manager.apply_network_presence(presence);
                }
            }));
            *manager.network.write() = Some(network.clone());
        }
        manager
    }

    pub fn on_change(&self, handler: impl Fn(&PresenceChange) + Send + Sync + 'static) {
        *self.on_change.write() = Some(Arc::new(handler));
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    fn now(&self) -> u64 {
        self.dispatcher.clock().now_ms()
    }

    fn notify(&self, changes: Vec<PresenceChange>) {
        if changes.is_empty() {
            return;
        }
        let handler = self.on_change.read().clone();
        if let Some(handler) = handler {
            for change in &changes {
                handler(change);
            }
        }
    }

    // Local participant

    pub fn local_entry(&self) -> PresenceEntry {
        self.local.lock().entry.clone()
    }

    pub fn status(&self) -> PresenceStatus {
        self.local.lock().activity.status()
    }

    pub fn set_profile(&self, display_name: impl Into<String>, color: impl Into<String>) {
        {
            let mut local = self.local.lock();
            local.entry.display_name = display_name.into();
            local.entry.color = color.into();
        }
        self.publish_entry();
    }

    /// Broadcast a join for the local participant
    pub fn announce(&self) {
        let entry = self.touch_local();
        self.dispatch_entry(types::PRESENCE_JOIN, &entry);
        self.send_network_presence(&entry);
    }

    /// Broadcast a leave for the local participant
    pub fn leave(&self) {
        let entry = self.local_entry();
        let params = MessageParams::new(Channel::Presence, types::PRESENCE_LEAVE)
            .with_payload(json!({ "id": entry.id }));
        self.dispatcher.dispatch(
            DispatchRequest::new(params)
                .with_policy_key(ENTRY_KEY)
                .with_scope(SyncScope::Device)
                .unthrottled(),
        );
    }

    pub fn record_activity(&self) {
        let changed = {
            let mut local = self.local.lock();
            let now = self.now();
            local.entry.last_seen = now;
            let changed = local.activity.record_activity(now);
            if let Some(status) = changed {
                local.entry.status = status;
            }
            changed
        };
        self.status_changed(changed);
    }

    pub fn set_hidden(&self, hidden: bool) {
        let changed = {
            let mut local = self.local.lock();
            let changed = local.activity.set_hidden(hidden, self.now());
            if let Some(status) = changed {
                local.entry.status = status;
            }
            changed
        };
        self.status_changed(changed);
    }

    /// Reclassify idle/away; returns the new status on change
    pub fn tick_activity(&self) -> Option<PresenceStatus> {
        let changed = {
            let mut local = self.local.lock();
            let changed = local.activity.tick(self.now());
            if let Some(status) = changed {
                local.entry.status = status;
            }
            changed
        };
        self.status_changed(changed);
        changed
    }

    fn status_changed(&self, changed: Option<PresenceStatus>) {
        if let Some(status) = changed {
            tracing::debug!(?status, "local presence status changed");
            self.notify(vec![PresenceChange::LocalStatus(status)]);
            self.publish_entry();
        }
    }

    pub fn update_cursor(&self, x: f64, y: f64) {
        let position = CursorPosition::new(x, y);
        self.local.lock().entry.cursor = Some(position);
        self.record_activity();
        let window = Duration::from_millis(self.config.cursor_throttle_ms);
        self.outgoing
            .submit(CURSOR_KEY, window, Outgoing::Cursor(position));
    }

    pub fn hide_cursor(&self) {
        self.local.lock().entry.cursor = None;
        let params = MessageParams::new(Channel::Cursor, types::CURSOR_HIDE);
        self.dispatcher
            .dispatch(DispatchRequest::new(params).with_policy_key("cursor:hide"));
    }

    pub fn update_selection<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.local.lock().entry.selection = Selection::new(ids);
        self.record_activity();
        self.publish_entry();
    }

    fn touch_local(&self) -> PresenceEntry {
        let mut local = self.local.lock();
        local.entry.last_seen = self.now();
        local.entry.clone()
    }

    fn publish_entry(&self) {
        let entry = self.touch_local();
        let window = Duration::from_millis(self.config.entry_throttle_ms);
        self.outgoing.submit(ENTRY_KEY, window, Outgoing::Entry(entry));
    }

    fn send(&self, item: Outgoing) {
        match item {
            Outgoing::Cursor(position) => {
                let params = MessageParams::new(Channel::Cursor, types::CURSOR_MOVE)
                    .with_payload(json!({ "x": position.x, "y": position.y }));
                self.dispatcher
                    .dispatch(DispatchRequest::new(params).with_policy_key(CURSOR_KEY).unthrottled());
            }
            Outgoing::Entry(entry) => {
                self.dispatch_entry(types::PRESENCE_UPDATE, &entry);
                self.send_network_presence(&entry);
            }
        }
    }

    /// Same-device tabs hear entries through the dispatcher
    fn dispatch_entry(&self, message_type: &str, entry: &PresenceEntry) {
        let payload = match serde_json::to_value(entry) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("presence encode failed: {}", e);
                return;
            }
        };
        let params = MessageParams::new(Channel::Presence, message_type).with_payload(payload);
        self.dispatcher.dispatch(
            DispatchRequest::new(params)
                .with_policy_key(ENTRY_KEY)
                .with_scope(SyncScope::Device)
                .unthrottled(),
        );
    }

    /// Remote users hear entries through the network presence feed
    fn send_network_presence(&self, entry: &PresenceEntry) {
        let network = self.network.read().clone();
        let Some(network) = network else {
            return;
        };
        if !network.is_connected() {
            return;
        }
        match serde_json::to_value(entry) {
            Ok(payload) => {
                if let Err(e) = network.send_presence(payload) {
                    tracing::debug!("presence not sent: {}", e);
                }
            }
            Err(e) => tracing::warn!("presence encode failed: {}", e),
        }
    }

    // Remote entries

    pub fn entries(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .remote
            .read()
            .values()
            .map(|t| t.entry.clone())
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn entry(&self, id: &str) -> Option<PresenceEntry> {
        self.remote.read().get(id).map(|t| t.entry.clone())
    }

    /// Smoothed cursor of a remote entry at `now_ms`
    pub fn render_cursor(&self, id: &str, now_ms: u64) -> Option<CursorPosition> {
        let remote = self.remote.read();
        let tracked = remote.get(id)?;
        match &tracked.track {
            Some(track) => Some(track.render(now_ms, self.config.extrapolation)),
            None => tracked.entry.cursor,
        }
    }

    fn is_own(&self, id: &str) -> bool {
        id == self.dispatcher.identity().tab_id.as_str()
    }

    fn is_own_device(&self, device_id: &str) -> bool {
        device_id == self.dispatcher.identity().device_id.as_str()
    }

    fn upsert(&self, mut entry: PresenceEntry, now: u64, latency: Option<u64>) -> Option<PresenceChange> {
        if self.is_own(&entry.id) {
            return None;
        }
        entry.is_same_device = self.is_own_device(&entry.device_id);
        entry.last_seen = now;
        entry.latency = latency.or(entry.latency);

        let mut remote = self.remote.write();
        let tracked = remote
            .entry(entry.id.clone())
            .or_insert_with(|| Tracked::new(entry.clone()));
        match entry.cursor {
            Some(position) => match tracked.track.as_mut() {
                Some(track) if track.latest() != position => track.push(position, now),
                Some(_) => {}
                None => tracked.track = Some(CursorTrack::new(position, now)),
            },
            None => tracked.track = None,
        }
        tracked.entry = entry.clone();
        Some(PresenceChange::Upserted(entry))
    }

    fn remove_where(&self, mut pred: impl FnMut(&Tracked) -> bool) -> Vec<PresenceChange> {
        let mut remote = self.remote.write();
        let gone: Vec<String> = remote
            .iter()
            .filter(|(_, t)| pred(t))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &gone {
            remote.remove(id);
        }
        gone.into_iter().map(PresenceChange::Removed).collect()
    }

    /// Same-device tab announced by the hub
    pub fn apply_tab_joined(&self, tab: &TabInfo) {
        if self.is_own(tab.tab_id()) {
            return;
        }
        let now = self.now();
        let entry = {
            let mut remote = self.remote.write();
            let tracked = remote
                .entry(tab.tab_id().to_string())
                .or_insert_with(|| Tracked::new(PresenceEntry::from_identity(&tab.identity, now)));
            tracked.pinned = true;
            tracked.entry.is_same_device = true;
            tracked.entry.last_seen = now;
            tracked.entry.clone()
        };
        self.notify(vec![PresenceChange::Upserted(entry)]);
    }

    pub fn apply_tab_left(&self, tab_id: &str) {
        let removed = self.remote.write().remove(tab_id).is_some();
        if removed {
            self.notify(vec![PresenceChange::Removed(tab_id.to_string())]);
        }
    }

    /// Full remote list; replaces every entry not on this device
    pub fn apply_remote_list(&self, entries: Vec<PresenceEntry>) {
        let now = self.now();
        let mut changes = self.remove_where(|t| !t.entry.is_same_device);
        for entry in entries {
            if self.is_own_device(&entry.device_id) {
                continue;
            }
            changes.extend(self.upsert(entry, now, None));
        }
        self.notify(changes);
    }

    pub fn apply_remote_update(&self, entry: PresenceEntry) {
        if self.is_own_device(&entry.device_id) {
            return;
        }
        let change = self.upsert(entry, self.now(), None);
        self.notify(change.into_iter().collect());
    }

    /// A remote user (or one of their tabs) left
    pub fn apply_remote_left(&self, id: &str) {
        let changes = self.remove_where(|t| {
            !t.entry.is_same_device && (t.entry.id == id || t.entry.user_id.as_deref() == Some(id))
        });
        self.notify(changes);
    }

    pub fn apply_network_presence(&self, presence: RemotePresence) {
        match presence {
            RemotePresence::List(users) => {
                let entries = users.into_iter().filter_map(parse_entry).collect();
                self.apply_remote_list(entries);
            }
            RemotePresence::Update(value) => {
                if let Some(entry) = parse_entry(value) {
                    self.apply_remote_update(entry);
                }
            }
            RemotePresence::Left(user_id) => self.apply_remote_left(&user_id),
        }
    }

    /// Purge entries silent for longer than the stale timeout
    pub fn cleanup_stale(&self) -> Vec<String> {
        let now = self.now();
        let timeout = self.config.stale_timeout_ms;
        let changes = self.remove_where(|t| !t.pinned && t.entry.is_stale(now, timeout));
        let removed = changes
            .iter()
            .filter_map(|c| match c {
                PresenceChange::Removed(id) => Some(id.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "purged stale presence");
        }
        self.notify(changes);
        removed
    }

    fn handle_message(&self, message: &RuntimeMessage) {
        if self.is_own(message.identity.tab_id.as_str()) {
            return;
        }
        let now = self.now();
        let latency = Some(now.saturating_sub(message.timestamp));

        let changes: Vec<PresenceChange> = match message.message_type.as_str() {
            types::PRESENCE_JOIN | types::PRESENCE_UPDATE => {
                let entry = parse_entry(message.payload.clone())
                    .unwrap_or_else(|| PresenceEntry::from_identity(&message.identity, now));
                self.upsert(entry, now, latency).into_iter().collect()
            }
            types::PRESENCE_LEAVE => {
                let id = message.identity.tab_id.to_string();
                self.remove_where(|t| t.entry.id == id)
            }
            types::PRESENCE_LIST => {
                let entries = message
                    .payload
                    .get("entries")
                    .and_then(Value::as_array)
                    .map(|list| list.iter().cloned().filter_map(parse_entry).collect())
                    .unwrap_or_default();
                self.apply_remote_list(entries);
                Vec::new()
            }
            types::CURSOR_MOVE => match serde_json::from_value::<CursorPosition>(message.payload.clone()) {
                Ok(position) => {
                    let mut entry = self
                        .entry(message.identity.tab_id.as_str())
                        .unwrap_or_else(|| PresenceEntry::from_identity(&message.identity, now));
                    entry.cursor = Some(position);
                    self.upsert(entry, now, latency).into_iter().collect()
                }
                Err(e) => {
                    tracing::debug!(message_id = %message.id, "bad cursor payload: {}", e);
                    Vec::new()
                }
            },
            types::CURSOR_HIDE => match self.entry(message.identity.tab_id.as_str()) {
                Some(mut entry) => {
                    entry.cursor = None;
                    self.upsert(entry, now, latency).into_iter().collect()
                }
                None => Vec::new(),
            },
            other => {
                tracing::trace!(message_type = other, "ignoring presence message");
                Vec::new()
            }
        };
        self.notify(changes);
    }

    /// Start the activity check and stale cleanup timers
    pub fn spawn_timers(self: &Arc<Self>) -> PresenceTimers {
        let activity = spawn_every(
            Arc::downgrade(self),
            self.config.activity_check_interval_ms,
            |manager| {
                manager.tick_activity();
            },
        );
        let cleanup = spawn_every(Arc::downgrade(self), self.config.cleanup_interval_ms, |manager| {
            manager.cleanup_stale();
        });
        PresenceTimers {
            handles: vec![activity, cleanup],
        }
    }
}

impl Drop for PresenceManager {
    fn drop(&mut self) {
        for subscription in self.subscriptions.lock().drain(..) {
            self.dispatcher.unsubscribe(&subscription);
        }
    }
}

fn parse_entry(value: Value) -> Option<PresenceEntry> {
    match serde_json::from_value(value) {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::debug!("skipping presence entry: {}", e);
            None
        }
    }
}

fn spawn_every(
    manager: Weak<PresenceManager>,
    period_ms: u64,
    tick: fn(&PresenceManager),
) -> JoinHandle<()> {
    let period = Duration::from_millis(period_ms.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            tick(&manager);
        }
    })
}

/// Running presence timers; aborted on drop
#[derive(Debug)]
pub struct PresenceTimers {
    handles: Vec<JoinHandle<()>>,
}

impl PresenceTimers {
    pub fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for PresenceTimers {
    fn drop(&mut self) {
        self.stop();
    }
}
