//! Network transport client
//!
//! One supervisor task owns the socket. Each session runs: connect, optional
//! auth, optional room join, flush of the outbound queue, then a select loop
//! over inbound frames, the writer channel and the heartbeat ticker. When a
//! session ends, anything still in the writer channel goes back to the head
//! of the queue so the next session sends it first.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use tabmesh_core::{system_clock, Identity, SharedClock, SyncScope};
use tabmesh_wire::{MessageTarget, RuntimeMessage};

use super::{backoff_delay, NetFrame, NetworkConfig, NetworkConnector, NetworkSocket, WsConnector};
use crate::queue::report_overflow;
use crate::{
    ConnectionState, InboundHandler, OutboundQueue, OverflowHandler, QueueConfig,
    StateChangeHandler, Transport, TransportCounters, TransportError, TransportResult,
    TransportStats,
};

/// Missed-ack multiple of the heartbeat interval that forces a reconnect
const HEARTBEAT_ACK_FACTOR: u32 = 3;

/// Remote presence feed
#[derive(Clone, Debug, PartialEq)]
pub enum RemotePresence {
    /// Full list of remote users, replacing what was known
    List(Vec<Value>),
    /// One user's entry changed
    Update(Value),
    /// A user left the room
    Left(String),
}

pub type PresenceHandler = Arc<dyn Fn(RemotePresence) + Send + Sync>;

enum Outbound {
    Message(RuntimeMessage),
    Control(NetFrame),
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct NetLink {
    state: ConnectionState,
    writer: Option<mpsc::UnboundedSender<Outbound>>,
    queue: OutboundQueue,
    task: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

struct NetInner {
    name: String,
    identity: Identity,
    config: NetworkConfig,
    scope: SyncScope,
    connector: Arc<dyn NetworkConnector>,
    clock: SharedClock,
    room: RwLock<Option<String>>,
    link: Mutex<NetLink>,
    handler: RwLock<Option<InboundHandler>>,
    presence_handler: RwLock<Option<PresenceHandler>>,
    state_handler: RwLock<Option<StateChangeHandler>>,
    overflow: RwLock<Option<OverflowHandler>>,
    counters: TransportCounters,
}

/// Multi-device transport over a remote socket
///
/// Scope is `canvas` when a room is configured at construction, else `user`.
#[derive(Clone)]
pub struct NetworkTransport {
    inner: Arc<NetInner>,
}

impl NetworkTransport {
    pub const NAME: &'static str = "network";

    /// WebSocket transport
    pub fn new(identity: Identity, config: NetworkConfig) -> Self {
        Self::with_connector(identity, config, Arc::new(WsConnector))
    }

    pub fn with_connector(
        identity: Identity,
        config: NetworkConfig,
        connector: Arc<dyn NetworkConnector>,
    ) -> Self {
        Self::build(identity, config, connector, &QueueConfig::default(), system_clock())
    }

    pub fn build(
        identity: Identity,
        config: NetworkConfig,
        connector: Arc<dyn NetworkConnector>,
        queue: &QueueConfig,
        clock: SharedClock,
    ) -> Self {
        let scope = if config.room_id.is_some() {
            SyncScope::Canvas
        } else {
            SyncScope::User
        };
        NetworkTransport {
            inner: Arc::new(NetInner {
                name: Self::NAME.to_string(),
                identity,
                room: RwLock::new(config.room_id.clone()),
                config,
                scope,
                connector,
                clock,
                link: Mutex::new(NetLink {
                    state: ConnectionState::Disconnected,
                    writer: None,
                    queue: OutboundQueue::from_config(queue),
                    task: None,
                    shutdown: None,
                }),
                handler: RwLock::new(None),
                presence_handler: RwLock::new(None),
                state_handler: RwLock::new(None),
                overflow: RwLock::new(None),
                counters: TransportCounters::new(),
            }),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.link.lock().state.clone()
    }

    pub fn on_state_change(&self, handler: StateChangeHandler) {
        *self.inner.state_handler.write() = Some(handler);
    }

    pub fn on_presence(&self, handler: PresenceHandler) {
        *self.inner.presence_handler.write() = Some(handler);
    }

    pub fn room(&self) -> Option<String> {
        self.inner.room.read().clone()
    }

    /// Publish our own presence entry to the room
    ///
    /// Presence is not queued: a stale entry is worse than none.
    pub fn send_presence(&self, payload: Value) -> TransportResult<()> {
        self.control(NetFrame::PresenceUpdate { payload })
    }

    /// Switch to `room_id`, leaving the current room first
    pub fn join_room(&self, room_id: impl Into<String>) -> TransportResult<()> {
        let room_id = room_id.into();
        let previous = self.inner.room.write().replace(room_id.clone());
        if !self.is_connected() {
            return Ok(());
        }
        if let Some(previous) = previous.filter(|p| *p != room_id) {
            self.control(NetFrame::LeaveRoom { room_id: previous })?;
        }
        self.control(NetFrame::JoinRoom { room_id })
    }

    pub fn leave_room(&self) -> TransportResult<()> {
        let previous = self.inner.room.write().take();
        match previous {
            Some(room_id) if self.is_connected() => self.control(NetFrame::LeaveRoom { room_id }),
            _ => Ok(()),
        }
    }

    fn control(&self, frame: NetFrame) -> TransportResult<()> {
        let link = self.inner.link.lock();
        match (&link.state, &link.writer) {
            (ConnectionState::Connected, Some(writer)) => writer
                .send(Outbound::Control(frame))
                .map_err(|_| TransportError::NotConnected),
            _ => Err(TransportError::NotConnected),
        }
    }
}

impl NetInner {
    fn set_state(&self, state: ConnectionState) {
        {
            let mut link = self.link.lock();
            if link.state == state {
                return;
            }
            link.state = state.clone();
        }
        match &state {
            ConnectionState::Failed { reason } => {
                tracing::warn!(transport = %self.name, %reason, "network transport failed")
            }
            other => tracing::info!(transport = %self.name, state = ?other, "network state changed"),
        }
        let handler = self.state_handler.read().clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    fn emit_presence(&self, presence: RemotePresence) {
        let handler = self.presence_handler.read().clone();
        if let Some(handler) = handler {
            handler(presence);
        }
    }

    fn deliver(&self, payload: Value) {
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                tracing::warn!(transport = %self.name, "network payload encode failed: {}", e);
                return;
            }
        };
        self.counters.record_received();
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(bytes);
        }
    }

    /// Apply one inbound frame; returns a reply to send, if any
    fn handle_frame(&self, frame: NetFrame, last_ack: &mut Instant) -> Option<NetFrame> {
        match frame {
            NetFrame::Broadcast { payload } | NetFrame::Direct { payload, .. } => {
                self.deliver(payload);
            }
            NetFrame::PresenceList { users } | NetFrame::RoomJoined { users, .. } => {
                self.emit_presence(RemotePresence::List(users));
            }
            NetFrame::PresenceUpdate { payload } => {
                self.emit_presence(RemotePresence::Update(payload));
            }
            NetFrame::RoomLeft {
                user_id: Some(user_id),
                ..
            } => {
                self.emit_presence(RemotePresence::Left(user_id));
            }
            NetFrame::RoomLeft { room_id, user_id: None } => {
                tracing::debug!(transport = %self.name, %room_id, "left room");
            }
            NetFrame::Heartbeat { timestamp } => return Some(NetFrame::HeartbeatAck { timestamp }),
            NetFrame::HeartbeatAck { .. } => *last_ack = Instant::now(),
            NetFrame::Error { message } => {
                tracing::warn!(transport = %self.name, "server error: {}", message);
            }
            other => {
                tracing::debug!(transport = %self.name, kind = other.kind(), "ignoring frame");
            }
        }
        None
    }

    /// Read frames until `want` matches, applying everything else
    async fn await_reply(
        &self,
        socket: &mut Box<dyn NetworkSocket>,
        step: &'static str,
        want: fn(&NetFrame) -> bool,
    ) -> TransportResult<NetFrame> {
        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        let deadline = Instant::now() + timeout;
        let mut last_ack = Instant::now();
        loop {
            let next = tokio::time::timeout_at(deadline, socket.recv_text())
                .await
                .map_err(|_| TransportError::Timeout(step))?;
            let text = match next {
                Some(text) => text?,
                None => return Err(TransportError::ConnectionFailed(format!("closed during {}", step))),
            };
            let frame = match NetFrame::decode(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(transport = %self.name, "malformed network frame: {}", e);
                    continue;
                }
            };
            if want(&frame) {
                return Ok(frame);
            }
            if let NetFrame::Error { message } = frame {
                return Err(TransportError::Handshake(message));
            }
            if let Some(reply) = self.handle_frame(frame, &mut last_ack) {
                socket.send_text(reply.encode()?).await?;
            }
        }
    }

    async fn establish(&self) -> TransportResult<Box<dyn NetworkSocket>> {
        let mut socket = self.connector.connect(&self.config.url).await?;

        if let Some(token) = &self.config.auth_token {
            self.set_state(ConnectionState::Authenticating);
            let auth = NetFrame::Auth {
                token: token.clone(),
                identity: self.identity.clone(),
            };
            socket.send_text(auth.encode()?).await?;
            let reply = self
                .await_reply(&mut socket, "auth", |f| {
                    matches!(f, NetFrame::AuthSuccess { .. } | NetFrame::AuthFailed { .. })
                })
                .await?;
            if let NetFrame::AuthFailed { reason } = reply {
                return Err(TransportError::AuthFailed(reason));
            }
        }

        let room = self.room.read().clone();
        if let Some(room_id) = room {
            socket
                .send_text(NetFrame::JoinRoom { room_id }.encode()?)
                .await?;
            let reply = self
                .await_reply(&mut socket, "room join", |f| matches!(f, NetFrame::RoomJoined { .. }))
                .await?;
            let mut last_ack = Instant::now();
            self.handle_frame(reply, &mut last_ack);
        }

        Ok(socket)
    }

    /// Open the writer with the queued backlog ahead of anything new
    fn activate(&self) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        let flushed = {
            let mut link = self.link.lock();
            let backlog = link.queue.drain();
            let flushed = backlog.len();
            for message in backlog {
                let _ = tx.send(Outbound::Message(message));
            }
            link.writer = Some(tx);
            flushed
        };
        if flushed > 0 {
            tracing::info!(transport = %self.name, flushed, "flushing queued messages");
        }
        self.set_state(ConnectionState::Connected);
        rx
    }

    fn frame_for(message: &RuntimeMessage) -> TransportResult<NetFrame> {
        let payload = serde_json::to_value(message)?;
        Ok(match (&message.target, &message.target_id) {
            (MessageTarget::Specific, Some(target_id)) => NetFrame::Direct {
                target_id: target_id.clone(),
                payload,
            },
            _ => NetFrame::Broadcast { payload },
        })
    }

    async fn run_session(
        &self,
        mut socket: Box<dyn NetworkSocket>,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let period = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let ack_deadline = period * HEARTBEAT_ACK_FACTOR;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        let mut last_ack = Instant::now();
        let mut unsent: Option<RuntimeMessage> = None;

        let end = loop {
            tokio::select! {
                incoming = socket.recv_text() => match incoming {
                    Some(Ok(text)) => match NetFrame::decode(&text) {
                        Ok(frame) => {
                            if let Some(reply) = self.handle_frame(frame, &mut last_ack) {
                                match reply.encode() {
                                    Ok(text) => {
                                        if let Err(e) = socket.send_text(text).await {
                                            break SessionEnd::Lost(e.to_string());
                                        }
                                    }
                                    Err(e) => tracing::warn!(transport = %self.name, "encode failed: {}", e),
                                }
                            }
                        }
                        Err(e) => tracing::warn!(transport = %self.name, "malformed network frame: {}", e),
                    },
                    Some(Err(e)) => break SessionEnd::Lost(e.to_string()),
                    None => break SessionEnd::Lost("socket closed".into()),
                },
                next = outbound.recv() => {
                    let Some(next) = next else {
                        break SessionEnd::Lost("writer closed".into());
                    };
                    let (frame, message) = match next {
                        Outbound::Message(message) => match Self::frame_for(&message) {
                            Ok(frame) => (frame, Some(message)),
                            Err(e) => {
                                tracing::warn!(transport = %self.name, message_id = %message.id, "encode failed: {}", e);
                                continue;
                            }
                        },
                        Outbound::Control(frame) => (frame, None),
                    };
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(transport = %self.name, "encode failed: {}", e);
                            continue;
                        }
                    };
                    match socket.send_text(text).await {
                        Ok(()) => {
                            if message.is_some() {
                                self.counters.record_sent();
                            }
                        }
                        Err(e) => {
                            unsent = message;
                            break SessionEnd::Lost(e.to_string());
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if last_ack.elapsed() > ack_deadline {
                        tracing::warn!(transport = %self.name, "heartbeat ack overdue, reconnecting");
                        break SessionEnd::Lost("heartbeat timeout".into());
                    }
                    let beat = NetFrame::Heartbeat { timestamp: self.clock.now_ms() };
                    let sent = match beat.encode() {
                        Ok(text) => socket.send_text(text).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        break SessionEnd::Lost(e.to_string());
                    }
                }
                _ = shutdown.changed() => {
                    let room = self.room.read().clone();
                    if let Some(room_id) = room {
                        if let Ok(text) = (NetFrame::LeaveRoom { room_id }).encode() {
                            let _ = socket.send_text(text).await;
                        }
                    }
                    let _ = socket.close().await;
                    break SessionEnd::Shutdown;
                }
            }
        };

        // Requeue under the lock so concurrent sends land behind the backlog
        let mut link = self.link.lock();
        link.writer = None;
        let mut backlog: Vec<RuntimeMessage> = unsent.into_iter().collect();
        while let Ok(next) = outbound.try_recv() {
            if let Outbound::Message(message) = next {
                backlog.push(message);
            }
        }
        let evicted = if backlog.is_empty() {
            Vec::new()
        } else {
            tracing::debug!(transport = %self.name, count = backlog.len(), "requeued unsent messages");
            link.queue.requeue_front(backlog)
        };
        drop(link);
        self.report_evicted(&evicted);
        end
    }

    fn report_evicted(&self, evicted: &[RuntimeMessage]) {
        if evicted.is_empty() {
            return;
        }
        let handler = self.overflow.read().clone();
        for message in evicted {
            report_overflow(&self.name, message, &self.counters, handler.clone());
        }
    }

    async fn supervise(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        ready: oneshot::Sender<TransportResult<()>>,
    ) {
        let mut ready = Some(ready);
        let mut attempt = 0u32;

        loop {
            match self.establish().await {
                Ok(socket) => {
                    attempt = 0;
                    let outbound = self.activate();
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                    match self.run_session(socket, outbound, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            tracing::warn!(transport = %self.name, %reason, "network session lost")
                        }
                    }
                }
                Err(TransportError::AuthFailed(reason)) => {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(TransportError::AuthFailed(reason.clone())));
                    }
                    self.finish(ConnectionState::Failed {
                        reason: format!("authentication failed: {}", reason),
                    });
                    return;
                }
                Err(e) => {
                    tracing::warn!(transport = %self.name, attempt, "network connect failed: {}", e);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(e));
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
            attempt += 1;
            let max = self.config.reconnect.max_attempts;
            if max > 0 && attempt > max {
                self.finish(ConnectionState::Failed {
                    reason: TransportError::Exhausted(max).to_string(),
                });
                return;
            }

            self.set_state(ConnectionState::Reconnecting { attempt });
            let delay = backoff_delay(attempt, &self.config.reconnect, rand::random::<f64>());
            tracing::debug!(transport = %self.name, attempt, ?delay, "reconnecting after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.finish(ConnectionState::Disconnected);
    }

    fn finish(&self, state: ConnectionState) {
        {
            let mut link = self.link.lock();
            link.writer = None;
            link.task = None;
            link.shutdown = None;
        }
        self.set_state(state);
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn scope(&self) -> SyncScope {
        self.inner.scope
    }

    fn send(&self, message: &RuntimeMessage) -> TransportResult<()> {
        let mut link = self.inner.link.lock();
        if let Some(writer) = &link.writer {
            if writer.send(Outbound::Message(message.clone())).is_ok() {
                return Ok(());
            }
        }
        if !(link.state.is_connected() || link.state.is_pending()) {
            return Err(TransportError::NotConnected);
        }

        if let Some(evicted) = link.queue.push(message.clone()) {
            drop(link);
            let handler = self.inner.overflow.read().clone();
            report_overflow(&self.inner.name, &evicted, &self.inner.counters, handler);
        }
        Ok(())
    }

    fn on_message(&self, handler: InboundHandler) {
        *self.inner.handler.write() = Some(handler);
    }

    fn is_connected(&self) -> bool {
        self.inner.link.lock().state.is_connected()
    }

    fn accepts_outbound(&self) -> bool {
        let link = self.inner.link.lock();
        link.state.is_connected() || link.state.is_pending()
    }

    fn on_queue_overflow(&self, handler: OverflowHandler) {
        *self.inner.overflow.write() = Some(handler);
    }

    fn stats(&self) -> TransportStats {
        let queued = self.inner.link.lock().queue.len();
        self.inner.counters.snapshot(queued)
    }

    async fn connect(&self) -> TransportResult<()> {
        let ready = {
            let mut link = self.inner.link.lock();
            if link.task.is_some() {
                return Ok(());
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let (ready_tx, ready_rx) = oneshot::channel();
            link.state = ConnectionState::Connecting;
            link.shutdown = Some(shutdown_tx);
            link.task = Some(tokio::spawn(
                Arc::clone(&self.inner).supervise(shutdown_rx, ready_tx),
            ));
            ready_rx
        };

        match ready.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionFailed(
                "network supervisor stopped".into(),
            )),
        }
    }

    async fn disconnect(&self) {
        let (shutdown, task) = {
            let mut link = self.inner.link.lock();
            (link.shutdown.take(), link.task.take())
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

impl std::fmt::Debug for NetworkTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkTransport")
            .field("name", &self.inner.name)
            .field("scope", &self.inner.scope)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryConnector, MemoryServer, MemorySocketPeer, ReconnectConfig};
    use serde_json::json;
    use tabmesh_wire::{create_message, Channel, MessageParams};

    fn identity() -> Identity {
        Identity::new("dev-1".into(), "tab-a".into(), "ses".into()).with_user("u1")
    }

    fn message(n: u64) -> RuntimeMessage {
        create_message(MessageParams::new(Channel::Events, "emit_event"), &identity(), n)
    }

    fn transport(config: NetworkConfig) -> (NetworkTransport, MemoryConnector, MemoryServer) {
        let (connector, server) = MemoryConnector::new();
        let transport =
            NetworkTransport::with_connector(identity(), config, Arc::new(connector.clone()));
        (transport, connector, server)
    }

    fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts,
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

    async fn next_payload_ts(peer: &mut MemorySocketPeer) -> u64 {
        match peer.recv_non_heartbeat().await.unwrap() {
            NetFrame::Broadcast { payload } => payload["timestamp"].as_u64().unwrap(),
            other => panic!("expected broadcast, got {:?}", other),
        }
    }

    #[test]
    fn test_scope_from_room() {
        let (plain, _, _) = transport(NetworkConfig::new("mem://sync"));
        let (room, _, _) = transport(NetworkConfig::new("mem://sync").with_room("canvas-1"));
        assert_eq!(plain.scope(), SyncScope::User);
        assert_eq!(room.scope(), SyncScope::Canvas);
    }

    #[tokio::test]
    async fn test_auth_after_open_and_room_join() {
        let config = NetworkConfig::new("mem://sync")
            .with_auth_token("tok-123")
            .with_room("canvas-1");
        let (transport, connector, mut server) = transport(config);

        let (presence_tx, mut presence_rx) = mpsc::unbounded_channel();
        transport.on_presence(Arc::new(move |p| {
            let _ = presence_tx.send(p);
        }));

        let client = tokio::spawn({
            let transport = transport.clone();
            async move { transport.connect().await }
        });

        let mut peer = accept(&mut server).await;
        assert!(!peer.url.contains("tok-123"));
        match peer.recv_frame().await.unwrap() {
            NetFrame::Auth { token, identity } => {
                assert_eq!(token, "tok-123");
                assert_eq!(identity.tab_id.as_str(), "tab-a");
            }
            other => panic!("expected auth, got {:?}", other),
        }
        peer.send_frame(&NetFrame::AuthSuccess { user_id: Some("u1".into()) });

        assert_eq!(
            peer.recv_frame().await.unwrap(),
            NetFrame::JoinRoom {
                room_id: "canvas-1".into()
            }
        );
        peer.send_frame(&NetFrame::RoomJoined {
            room_id: "canvas-1".into(),
            users: vec![json!({"userId": "u2"})],
        });

        client.await.unwrap().unwrap();
        assert!(transport.is_connected());
        assert_eq!(connector.dialed_urls(), vec!["mem://sync".to_string()]);
        assert_eq!(
            presence_rx.recv().await.unwrap(),
            RemotePresence::List(vec![json!({"userId": "u2"})])
        );

        peer.send_frame(&NetFrame::RoomLeft {
            room_id: "canvas-1".into(),
            user_id: Some("u2".into()),
        });
        assert_eq!(
            presence_rx.recv().await.unwrap(),
            RemotePresence::Left("u2".into())
        );
    }

    #[tokio::test]
    async fn test_auth_failure_is_terminal() {
        let config = NetworkConfig::new("mem://sync").with_auth_token("bad");
        let (transport, _connector, mut server) = transport(config);

        let (state_tx, mut states) = mpsc::unbounded_channel();
        transport.on_state_change(Arc::new(move |s| {
            let _ = state_tx.send(s);
        }));

        let client = tokio::spawn({
            let transport = transport.clone();
            async move { transport.connect().await }
        });
        let mut peer = accept(&mut server).await;
        let _auth = peer.recv_frame().await.unwrap();
        peer.send_frame(&NetFrame::AuthFailed {
            reason: "expired".into(),
        });

        assert!(matches!(client.await.unwrap(), Err(TransportError::AuthFailed(_))));
        let mut last = None;
        while let Ok(state) = states.try_recv() {
            last = Some(state);
        }
        assert!(matches!(last, Some(ConnectionState::Failed { .. })));
        assert!(!transport.accepts_outbound());
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (transport, _connector, mut server) = transport(NetworkConfig::new("mem://sync"));
        let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
        transport.on_message(Arc::new(move |bytes| {
            let _ = inbound_tx.send(bytes);
        }));

        let client = tokio::spawn({
            let transport = transport.clone();
            async move { transport.connect().await }
        });
        let mut peer = accept(&mut server).await;
        client.await.unwrap().unwrap();

        transport.send(&message(7)).unwrap();
        assert_eq!(next_payload_ts(&mut peer).await, 7);

        let remote = create_message(
            MessageParams::new(Channel::Events, "emit_event"),
            &Identity::new("dev-2".into(), "tab-z".into(), "ses".into()),
            9,
        );
        peer.send_frame(&NetFrame::Broadcast {
            payload: serde_json::to_value(&remote).unwrap(),
        });
        let bytes = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(RuntimeMessage::decode(&bytes).unwrap().id, remote.id);
        assert_eq!(transport.stats().received, 1);
    }

    #[tokio::test]
    async fn test_direct_target_uses_direct_frame() {
        let (transport, _connector, mut server) = transport(NetworkConfig::new("mem://sync"));
        let client = tokio::spawn({
            let transport = transport.clone();
            async move { transport.connect().await }
        });
        let mut peer = accept(&mut server).await;
        client.await.unwrap().unwrap();

        let params = MessageParams::new(Channel::Events, "emit_event")
            .to_target(MessageTarget::Specific, "tab-z");
        transport.send(&create_message(params, &identity(), 1)).unwrap();

        match peer.recv_non_heartbeat().await.unwrap() {
            NetFrame::Direct { target_id, .. } => assert_eq!(target_id, "tab-z"),
            other => panic!("expected direct, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_flushed_in_order_after_reconnect() {
        let config = NetworkConfig::new("mem://sync").with_reconnect(fast_reconnect(5));
        let (transport, _connector, mut server) = transport(config);
        let client = tokio::spawn({
            let transport = transport.clone();
            async move { transport.connect().await }
        });
        let peer = accept(&mut server).await;
        client.await.unwrap().unwrap();

        drop(peer);
        while transport.is_connected() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for n in 1..=3 {
            transport.send(&message(n)).unwrap();
        }
        assert_eq!(transport.stats().queued, 3);

        let mut peer = accept(&mut server).await;
        while !transport.is_connected() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        transport.send(&message(4)).unwrap();

        for expected in 1..=4 {
            assert_eq!(next_payload_ts(&mut peer).await, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeat_acks_force_reconnect() {
        let config = NetworkConfig::new("mem://sync")
            .with_heartbeat_interval(100)
            .with_reconnect(fast_reconnect(5));
        let (transport, _connector, mut server) = transport(config);
        let client = tokio::spawn({
            let transport = transport.clone();
            async move { transport.connect().await }
        });
        let mut silent = accept(&mut server).await;
        client.await.unwrap().unwrap();

        // Never acknowledge; the client must give up and dial again
        let mut beats = 0;
        while let Some(frame) = silent.recv_frame().await {
            if matches!(frame, NetFrame::Heartbeat { .. }) {
                beats += 1;
            }
        }
        assert!(beats >= 3);

        let _second = accept(&mut server).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_fails() {
        let config = NetworkConfig::new("mem://sync").with_reconnect(fast_reconnect(2));
        let (transport, connector, _server) = transport(config);
        connector.set_refuse(true);

        let (state_tx, mut states) = mpsc::unbounded_channel();
        transport.on_state_change(Arc::new(move |s| {
            let _ = state_tx.send(s);
        }));

        assert!(transport.connect().await.is_err());
        // The initial failure still leaves the link retrying
        assert!(transport.accepts_outbound());

        let failed = loop {
            let state = tokio::time::timeout(Duration::from_secs(5), states.recv())
                .await
                .unwrap()
                .unwrap();
            if state.is_failed() {
                break state;
            }
        };
        assert!(matches!(failed, ConnectionState::Failed { .. }));
        assert_eq!(connector.dialed_urls().len(), 3);
        assert!(!transport.accepts_outbound());
        assert!(transport.send(&message(1)).is_err());
    }

    #[tokio::test]
    async fn test_disconnect_leaves_room() {
        let config = NetworkConfig::new("mem://sync").with_room("canvas-1");
        let (transport, _connector, mut server) = transport(config);
        let client = tokio::spawn({
            let transport = transport.clone();
            async move { transport.connect().await }
        });
        let mut peer = accept(&mut server).await;
        let _join = peer.recv_frame().await.unwrap();
        peer.send_frame(&NetFrame::RoomJoined {
            room_id: "canvas-1".into(),
            users: vec![],
        });
        client.await.unwrap().unwrap();

        transport.disconnect().await;
        assert_eq!(
            peer.recv_non_heartbeat().await.unwrap(),
            NetFrame::LeaveRoom {
                room_id: "canvas-1".into()
            }
        );
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    }
}
