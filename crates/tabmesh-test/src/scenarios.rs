//! End-to-end scenarios across several contexts

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{json, Value};

use tabmesh_core::{Identity, ManualClock, SyncScope};
use tabmesh_presence::{PresenceConfig, PresenceManager};
use tabmesh_runtime::Inbound;
use tabmesh_state::StateSync;
use tabmesh_transport::{
    MemoryConnector, MemoryServer, MemorySocketPeer, NetFrame, NetworkConfig, NetworkTransport,
    ReconnectConfig, Transport,
};
use tabmesh_wire::{create_message, mark_seen, Channel, MessageParams, Verdict};

use crate::{Medium, TestContext, HUB, LOCAL_BUS, NETWORK};

fn context(device: &str, tab: &str) -> TestContext {
    TestContext::new(
        Identity::new(device.into(), tab.into(), "session".into()),
        ManualClock::shared(1_000),
    )
}

fn event_data(message: &tabmesh_wire::RuntimeMessage) -> &Value {
    &message.payload["data"]
}

#[tokio::test(start_paused = true)]
async fn test_cursor_burst_coalesced_to_network() {
    let ctx = TestContext::standard("dev1", "tabA");
    for x in 0..10 {
        ctx.dispatcher.emit_event("cursor:move", json!({"x": x, "y": 0}));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Every move reaches local handlers; only the first leaves at once
    assert_eq!(ctx.handled().len(), 10);
    let network = ctx.transport(NETWORK).unwrap();
    assert_eq!(network.sent_count(), 1);
    assert_eq!(ctx.transport(LOCAL_BUS).unwrap().sent_count(), 0);
    assert_eq!(ctx.transport(HUB).unwrap().sent_count(), 0);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let sent = network.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(event_data(&sent[0])["x"], 0);
    assert_eq!(event_data(&sent[1])["x"], 9);
    assert_eq!(ctx.total_sent(), 2);
}

#[test]
fn test_local_only_event_never_leaves() {
    let ctx = TestContext::standard("dev1", "tabA");
    ctx.dispatcher.emit_event("debug:trace", json!({"span": "render"}));

    assert_eq!(ctx.handled().len(), 1);
    assert_eq!(ctx.total_sent(), 0);
}

#[test]
fn test_already_seen_message_rejected() {
    let ctx = TestContext::standard("dev1", "tabA");
    let sibling = Identity::new("dev1".into(), "tabB".into(), "session".into());
    let message = create_message(
        MessageParams::new(Channel::Events, "emit_event")
            .with_payload(json!({"eventType": "widget:moved", "data": {}}))
            .with_scope(SyncScope::Canvas),
        &sibling,
        1_000,
    );
    let echoed = mark_seen(&message, "tabA");

    let frame = echoed.encode().unwrap();
    assert_eq!(
        ctx.dispatcher.handle_inbound(NETWORK, &frame),
        Inbound::Rejected(Verdict::AlreadySeen)
    );

    ctx.transport(NETWORK).unwrap().inject(&echoed).unwrap();
    assert!(ctx.handled().is_empty());
    assert_eq!(ctx.total_sent(), 0);
    assert_eq!(ctx.dispatcher.stats().dropped_loop, 2);
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        max_attempts: 5,
        base_delay_ms: 10,
        max_delay_ms: 40,
        jitter: 0.0,
    }
}

async fn accept(server: &mut MemoryServer) -> MemorySocketPeer {
    tokio::time::timeout(Duration::from_secs(5), server.accept())
        .await
        .unwrap()
        .unwrap()
}

async fn next_sequence(peer: &mut MemorySocketPeer) -> u64 {
    match peer.recv_non_heartbeat().await.unwrap() {
        NetFrame::Broadcast { payload } => payload["payload"]["data"]["n"].as_u64().unwrap(),
        other => panic!("expected broadcast, got {:?}", other),
    }
}

#[tokio::test]
async fn test_events_queued_across_reconnect_arrive_in_order() {
    let ctx = context("dev1", "tabA");
    let (connector, mut server) = MemoryConnector::new();
    let network = NetworkTransport::with_connector(
        ctx.dispatcher.identity().clone(),
        NetworkConfig::new("mem://sync").with_reconnect(fast_reconnect()),
        Arc::new(connector),
    );
    ctx.dispatcher.register_transport(Arc::new(network.clone()));

    let client = tokio::spawn({
        let network = network.clone();
        async move { network.connect().await }
    });
    let peer = accept(&mut server).await;
    client.await.unwrap().unwrap();

    drop(peer);
    while network.is_connected() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    for n in 1..=3 {
        ctx.dispatcher.emit_event("pipeline:progress", json!({"n": n}));
    }
    assert_eq!(network.stats().queued, 3);

    let mut peer = accept(&mut server).await;
    while !network.is_connected() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    ctx.dispatcher.emit_event("pipeline:progress", json!({"n": 4}));

    for expected in 1..=4 {
        assert_eq!(next_sequence(&mut peer).await, expected);
    }
}

#[test]
fn test_canvas_event_relayed_to_bus_only_tab() {
    let bus = Medium::new();
    let net = Medium::new();

    let relay = context("dev1", "tabA");
    relay.join(LOCAL_BUS, SyncScope::Device, &bus);
    relay.join(NETWORK, SyncScope::Canvas, &net);
    let bus_only = context("dev1", "tabB");
    bus_only.join(LOCAL_BUS, SyncScope::Device, &bus);
    let remote = context("dev2", "tabC");
    remote.join(NETWORK, SyncScope::Canvas, &net);

    remote.dispatcher.emit_event("canvas:changed", json!({"rev": 3}));
    assert_eq!(relay.received().len(), 1);
    assert_eq!(bus_only.received().len(), 1);
    assert_eq!(event_data(&bus_only.received()[0])["rev"], 3);
    assert_eq!(relay.dispatcher.stats().relayed, 1);

    // Device-wide events stay on the device
    bus_only.dispatcher.emit_event("system:ready", json!({}));
    assert_eq!(relay.received().len(), 2);
    assert_eq!(remote.received().len(), 0);
}

#[test]
fn test_diamond_delivers_once() {
    let bus = Medium::new();
    let hub = Medium::new();
    let a = context("dev1", "tabA");
    let b = context("dev1", "tabB");
    for ctx in [&a, &b] {
        ctx.join(LOCAL_BUS, SyncScope::Device, &bus);
        ctx.join(HUB, SyncScope::Device, &hub);
    }

    a.dispatcher.emit_event("system:ready", json!({}));

    assert_eq!(b.received().len(), 1);
    assert!(b.dispatcher.stats().dropped_duplicate > 0);
    assert!(a.received().is_empty());
}

#[test]
fn test_presence_join_seen_by_sibling() {
    let bus = Medium::new();
    let a = context("dev1", "tabA");
    let b = context("dev1", "tabB");
    a.join(LOCAL_BUS, SyncScope::Device, &bus);
    b.join(LOCAL_BUS, SyncScope::Device, &bus);

    let presence_a = PresenceManager::new(Arc::clone(&a.dispatcher), PresenceConfig::default());
    let presence_b = PresenceManager::new(Arc::clone(&b.dispatcher), PresenceConfig::default());
    presence_a.set_profile("Ana", "#ff0000");
    presence_a.announce();

    let entries = presence_b.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, "tabA");
    assert_eq!(entries[0].display_name, "Ana");
    assert!(entries[0].is_same_device);
    assert!(presence_a.entries().is_empty());

    presence_a.leave();
    assert!(presence_b.entries().is_empty());
}

#[test]
fn test_session_state_shared_without_tokens() {
    let bus = Medium::new();
    let a = context("dev1", "tabA");
    let b = context("dev1", "tabB");
    a.join(LOCAL_BUS, SyncScope::Device, &bus);
    b.join(LOCAL_BUS, SyncScope::Device, &bus);

    let state_a = StateSync::new(Arc::clone(&a.dispatcher));
    let state_b = StateSync::new(Arc::clone(&b.dispatcher));
    state_a.publish(
        "session",
        &json!({"user": "ana", "accessToken": "s3cret"}),
        SyncScope::Device,
    );

    assert_eq!(state_b.get("session"), Some(json!({"user": "ana"})));
    assert_eq!(
        state_a.get("session"),
        Some(json!({"user": "ana", "accessToken": "s3cret"}))
    );
}

/// Contexts reachable from `origin` through shared mediums
fn reachable(membership: &[(bool, bool)], origin: usize) -> Vec<bool> {
    let mut seen = vec![false; membership.len()];
    let mut queue = VecDeque::from([origin]);
    seen[origin] = true;
    while let Some(i) = queue.pop_front() {
        for j in 0..membership.len() {
            let linked = (membership[i].0 && membership[j].0) || (membership[i].1 && membership[j].1);
            if !seen[j] && linked {
                seen[j] = true;
                queue.push_back(j);
            }
        }
    }
    seen
}

proptest! {
    #[test]
    fn prop_mesh_delivers_at_most_once(
        membership in proptest::collection::vec((any::<bool>(), any::<bool>()), 2..7),
        origin in any::<prop::sample::Index>(),
    ) {
        let bus = Medium::new();
        let hub = Medium::new();
        let contexts: Vec<TestContext> = (0..membership.len())
            .map(|i| {
                let ctx = context("dev1", &format!("tab{}", i));
                if membership[i].0 {
                    ctx.join(LOCAL_BUS, SyncScope::Device, &bus);
                }
                if membership[i].1 {
                    ctx.join(HUB, SyncScope::Device, &hub);
                }
                ctx
            })
            .collect();

        let origin = origin.index(contexts.len());
        contexts[origin].dispatcher.emit_event("system:ready", json!({}));

        let expected = reachable(&membership, origin);
        for (i, ctx) in contexts.iter().enumerate() {
            prop_assert_eq!(ctx.handled().len(), expected[i] as usize);
        }
    }
}
