//! Local event bridge
//!
//! Connects the host application's publish/subscribe surface to the
//! dispatcher. Local events go out through `emit_event`; inbound
//! `emit_event` messages from other contexts come back into the bus flagged
//! `remote` so the bridge does not send them again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use tabmesh_wire::{types, Channel, RuntimeMessage};

use crate::{Dispatcher, Subscription, SubscriptionId};

/// One application event
#[derive(Clone, Debug, PartialEq)]
pub struct LocalEvent {
    pub event_type: String,
    pub data: Value,
    /// Came from another context
    pub remote: bool,
    /// Originating tab id for remote events
    pub origin: Option<String>,
}

impl LocalEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        LocalEvent {
            event_type: event_type.into(),
            data,
            remote: false,
            origin: None,
        }
    }

    fn from_message(message: &RuntimeMessage) -> Option<Self> {
        let event_type = message.payload.get("eventType")?.as_str()?;
        Some(LocalEvent {
            event_type: event_type.to_string(),
            data: message.payload.get("data").cloned().unwrap_or(Value::Null),
            remote: true,
            origin: Some(message.origin().to_string()),
        })
    }
}

pub type LocalEventHandler = Arc<dyn Fn(&LocalEvent) + Send + Sync>;

/// The host's event emission facility
pub trait LocalEventBus: Send + Sync {
    fn emit(&self, event: LocalEvent);

    fn subscribe(&self, handler: LocalEventHandler) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// Synchronous in-process event bus
#[derive(Default)]
pub struct InMemoryEventBus {
    handlers: RwLock<Vec<(SubscriptionId, LocalEventHandler)>>,
    next_id: AtomicU64,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl LocalEventBus for InMemoryEventBus {
    fn emit(&self, event: LocalEvent) {
        let handlers: Vec<LocalEventHandler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }

    fn subscribe(&self, handler: LocalEventHandler) -> SubscriptionId {
        let id = SubscriptionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }
}

/// Two-way link between a `LocalEventBus` and a `Dispatcher`
pub struct EventBridge {
    dispatcher: Arc<Dispatcher>,
    bus: Arc<dyn LocalEventBus>,
    links: Mutex<Option<(SubscriptionId, Subscription)>>,
}

impl EventBridge {
    pub fn attach(dispatcher: Arc<Dispatcher>, bus: Arc<dyn LocalEventBus>) -> Self {
        let weak: Weak<Dispatcher> = Arc::downgrade(&dispatcher);
        let bus_id = bus.subscribe(Arc::new(move |event: &LocalEvent| {
            if event.remote {
                return;
            }
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.emit_event(&event.event_type, event.data.clone());
            }
        }));

        let own_tab = dispatcher.identity().tab_id.clone();
        let target: Weak<dyn LocalEventBus> = Arc::downgrade(&bus);
        let dispatch_sub = dispatcher.subscribe(Channel::Events, move |message| {
            if message.message_type != types::EMIT_EVENT || message.identity.tab_id == own_tab {
                return;
            }
            let Some(bus) = target.upgrade() else {
                return;
            };
            match LocalEvent::from_message(message) {
                Some(event) => bus.emit(event),
                None => tracing::debug!(message_id = %message.id, "emit_event without eventType"),
            }
        });

        EventBridge {
            dispatcher,
            bus,
            links: Mutex::new(Some((bus_id, dispatch_sub))),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.links.lock().is_some()
    }

    /// Remove both subscriptions; later calls are no-ops
    pub fn detach(&self) {
        if let Some((bus_id, dispatch_sub)) = self.links.lock().take() {
            self.bus.unsubscribe(bus_id);
            self.dispatcher.unsubscribe(&dispatch_sub);
        }
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DispatcherConfig;
    use serde_json::json;
    use tabmesh_core::{Identity, ManualClock, SyncScope};
    use tabmesh_policy::PolicyRegistry;
    use tabmesh_wire::{create_message, MessageParams};

    fn dispatcher(tab: &str) -> Arc<Dispatcher> {
        Dispatcher::new(
            Identity::new("dev".into(), tab.into(), "ses".into()),
            ManualClock::shared(0),
            Arc::new(PolicyRegistry::new()),
            DispatcherConfig::default(),
        )
    }

    fn recorder(bus: &InMemoryEventBus) -> Arc<Mutex<Vec<LocalEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bus.subscribe(Arc::new(move |e: &LocalEvent| sink.lock().push(e.clone())));
        events
    }

    #[test]
    fn test_local_events_are_dispatched_once() {
        let d = dispatcher("tabA");
        let bus = Arc::new(InMemoryEventBus::new());
        let seen = recorder(&bus);
        let _bridge = EventBridge::attach(Arc::clone(&d), bus.clone());

        bus.emit(LocalEvent::new("widget:moved", json!({"id": 1})));

        assert_eq!(d.stats().dispatched, 1);
        // The bridge never echoes our own event back into the bus
        assert_eq!(seen.lock().len(), 1);
        assert!(!seen.lock()[0].remote);
    }

    #[test]
    fn test_remote_events_reemitted_not_redispatched() {
        let d = dispatcher("tabA");
        let bus = Arc::new(InMemoryEventBus::new());
        let seen = recorder(&bus);
        let _bridge = EventBridge::attach(Arc::clone(&d), bus.clone());

        let inbound = create_message(
            MessageParams::new(Channel::Events, types::EMIT_EVENT)
                .with_payload(json!({"eventType": "widget:moved", "data": {"id": 7}}))
                .with_scope(SyncScope::Device),
            &Identity::new("dev".into(), "tabB".into(), "ses".into()),
            0,
        );
        d.handle_inbound("local_bus", &inbound.encode().unwrap());

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert!(events[0].remote);
        assert_eq!(events[0].origin.as_deref(), Some("tabB"));
        assert_eq!(events[0].data, json!({"id": 7}));
        assert_eq!(d.stats().dispatched, 0);
    }

    #[test]
    fn test_detach() {
        let d = dispatcher("tabA");
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = EventBridge::attach(Arc::clone(&d), bus.clone());
        assert_eq!(bus.subscriber_count(), 1);

        bridge.detach();
        bridge.detach();
        assert!(!bridge.is_attached());
        assert_eq!(bus.subscriber_count(), 0);

        bus.emit(LocalEvent::new("widget:moved", Value::Null));
        assert_eq!(d.stats().dispatched, 0);
    }
}
