//! Hub client transport

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader, Lines, ReadHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use tabmesh_core::{random_id, Identity, SyncScope};
use tabmesh_wire::RuntimeMessage;

use super::{HubConfig, HubEndpoint, HubStream};
use crate::queue::report_overflow;
use crate::{
    ConnectionState, HubFrame, InboundHandler, OutboundQueue, OverflowHandler, QueueConfig,
    StateChangeHandler, TabInfo, Transport, TransportCounters, TransportError, TransportResult,
    TransportStats,
};

/// Tab membership change seen through the hub
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TabEvent {
    Joined(TabInfo),
    Left(String),
}

pub type TabEventHandler = Arc<dyn Fn(TabEvent) + Send + Sync>;

/// One item for the session writer
#[derive(Debug)]
enum Outbound {
    Frame(HubFrame),
    Message(RuntimeMessage),
}

type FrameSender = mpsc::UnboundedSender<Outbound>;

struct HubLink {
    state: ConnectionState,
    writer: Option<FrameSender>,
    queue: OutboundQueue,
    task: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

struct HubInner {
    name: String,
    identity: Identity,
    endpoint: HubEndpoint,
    config: HubConfig,
    link: Mutex<HubLink>,
    handler: RwLock<Option<InboundHandler>>,
    tab_handler: RwLock<Option<TabEventHandler>>,
    state_handler: RwLock<Option<StateChangeHandler>>,
    overflow: RwLock<Option<OverflowHandler>>,
    requests: Mutex<HashMap<String, oneshot::Sender<Option<Value>>>>,
    known_tabs: RwLock<Vec<TabInfo>>,
    counters: TransportCounters,
}

/// Same-device transport through the hub broker
///
/// Sends issued before the registration handshake completes are buffered and
/// flushed in order once the broker answers.
#[derive(Clone)]
pub struct HubTransport {
    inner: Arc<HubInner>,
}

struct Session {
    lines: Lines<BufReader<ReadHalf<HubStream>>>,
    writer: FrameSender,
    /// Yields the messages it could not write
    writer_task: JoinHandle<Vec<RuntimeMessage>>,
    tabs: Vec<TabInfo>,
}

enum SessionEnd {
    Shutdown,
    Lost,
}

impl HubTransport {
    pub const NAME: &'static str = "hub";

    pub fn new(identity: Identity, endpoint: HubEndpoint, config: HubConfig) -> Self {
        Self::with_queue(identity, endpoint, config, &QueueConfig::default())
    }

    pub fn with_queue(
        identity: Identity,
        endpoint: HubEndpoint,
        config: HubConfig,
        queue: &QueueConfig,
    ) -> Self {
        HubTransport {
            inner: Arc::new(HubInner {
                name: Self::NAME.to_string(),
                identity,
                endpoint,
                config,
                link: Mutex::new(HubLink {
                    state: ConnectionState::Disconnected,
                    writer: None,
                    queue: OutboundQueue::from_config(queue),
                    task: None,
                    shutdown: None,
                }),
                handler: RwLock::new(None),
                tab_handler: RwLock::new(None),
                state_handler: RwLock::new(None),
                overflow: RwLock::new(None),
                requests: Mutex::new(HashMap::new()),
                known_tabs: RwLock::new(Vec::new()),
                counters: TransportCounters::new(),
            }),
        }
    }

    /// Connect to a broker over TCP using `config.addr`
    pub fn tcp(identity: Identity, config: HubConfig) -> Self {
        let endpoint = HubEndpoint::Tcp(config.addr.clone());
        Self::new(identity, endpoint, config)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.link.lock().state.clone()
    }

    /// Other tabs known to the broker
    pub fn known_tabs(&self) -> Vec<TabInfo> {
        self.inner.known_tabs.read().clone()
    }

    /// Tabs already registered when a session starts arrive as joins too
    pub fn on_tab_event(&self, handler: TabEventHandler) {
        *self.inner.tab_handler.write() = Some(handler);
    }

    pub fn on_state_change(&self, handler: StateChangeHandler) {
        *self.inner.state_handler.write() = Some(handler);
    }

    /// Read a value from the broker's shared store
    pub async fn get_shared_state(&self, key: &str) -> TransportResult<Option<Value>> {
        let writer = self.connected_writer()?;
        let request_id = random_id("req");
        let (tx, rx) = oneshot::channel();
        self.inner.requests.lock().insert(request_id.clone(), tx);

        let frame = HubFrame::GetState {
            request_id: request_id.clone(),
            key: key.to_string(),
        };
        if writer.send(Outbound::Frame(frame)).is_err() {
            self.inner.requests.lock().remove(&request_id);
            return Err(TransportError::NotConnected);
        }

        let timeout = Duration::from_millis(self.inner.config.request_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => {
                self.inner.requests.lock().remove(&request_id);
                Err(TransportError::Timeout("shared state"))
            }
        }
    }

    /// Write a value to the broker's shared store (last write wins)
    pub fn set_shared_state(&self, key: &str, value: Value) -> TransportResult<()> {
        let writer = self.connected_writer()?;
        writer
            .send(Outbound::Frame(HubFrame::SetState {
                key: key.to_string(),
                value,
            }))
            .map_err(|_| TransportError::NotConnected)
    }

    fn connected_writer(&self) -> TransportResult<FrameSender> {
        let link = self.inner.link.lock();
        match (&link.state, &link.writer) {
            (ConnectionState::Connected, Some(writer)) => Ok(writer.clone()),
            _ => Err(TransportError::NotConnected),
        }
    }
}

/// Wait for the broker's handshake reply
async fn read_registered(
    lines: &mut Lines<BufReader<ReadHalf<HubStream>>>,
) -> TransportResult<Vec<TabInfo>> {
    loop {
        match lines.next_line().await? {
            Some(line) => match HubFrame::decode(&line) {
                Ok(HubFrame::Registered { tabs }) => return Ok(tabs),
                Ok(HubFrame::Error { message }) => return Err(TransportError::Handshake(message)),
                Ok(other) => tracing::debug!(frame = ?other, "frame before registration"),
                Err(e) => tracing::warn!("malformed hub frame: {}", e),
            },
            None => return Err(TransportError::Handshake("hub closed the stream".into())),
        }
    }
}

/// Drain `rx` into `sink` until the channel closes or a write fails
///
/// After a failed write the channel is closed and every message still in it,
/// the failed one included, is returned in order.
async fn write_loop<W>(
    name: String,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut sink: W,
) -> Vec<RuntimeMessage>
where
    W: AsyncWrite + Unpin,
{
    while let Some(next) = rx.recv().await {
        let frame = match &next {
            Outbound::Frame(frame) => frame.clone(),
            Outbound::Message(message) => match serde_json::to_value(message) {
                Ok(payload) => HubFrame::Message { payload },
                Err(e) => {
                    tracing::warn!(transport = %name, message_id = %message.id, "hub encode failed: {}", e);
                    continue;
                }
            },
        };
        if let Err(e) = frame.write_to(&mut sink).await {
            tracing::warn!(transport = %name, "hub write failed: {}", e);
            rx.close();
            let mut unsent = Vec::new();
            if let Outbound::Message(message) = next {
                unsent.push(message);
            }
            while let Ok(rest) = rx.try_recv() {
                if let Outbound::Message(message) = rest {
                    unsent.push(message);
                }
            }
            return unsent;
        }
    }
    Vec::new()
}

impl HubInner {
    fn set_state(&self, state: ConnectionState) {
        {
            let mut link = self.link.lock();
            if link.state == state {
                return;
            }
            link.state = state.clone();
        }
        tracing::info!(transport = %self.name, state = ?state, "hub connection state changed");
        let handler = self.state_handler.read().clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    async fn establish(&self) -> TransportResult<Session> {
        let stream = self.endpoint.open().await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
        let writer_task = tokio::spawn(write_loop(self.name.clone(), rx, write_half));

        let mut lines = BufReader::new(read_half).lines();
        let register = HubFrame::Register {
            identity: self.identity.clone(),
        };
        if tx.send(Outbound::Frame(register)).is_err() {
            return Err(TransportError::Handshake("writer closed".into()));
        }

        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        let tabs = match tokio::time::timeout(timeout, read_registered(&mut lines)).await {
            Ok(Ok(tabs)) => tabs,
            Ok(Err(e)) => {
                writer_task.abort();
                return Err(e);
            }
            Err(_) => {
                writer_task.abort();
                return Err(TransportError::Timeout("hub registration"));
            }
        };

        Ok(Session {
            lines,
            writer: tx,
            writer_task,
            tabs,
        })
    }

    /// Mark connected and flush the buffer ahead of any new send
    fn activate(&self, session: &Session) {
        let changes = self.replace_known_tabs(session.tabs.clone());
        {
            let mut link = self.link.lock();
            for message in link.queue.drain() {
                if session.writer.send(Outbound::Message(message)).is_ok() {
                    self.counters.record_sent();
                }
            }
            link.writer = Some(session.writer.clone());
        }
        self.set_state(ConnectionState::Connected);
        for event in changes {
            self.emit_tab_event(event);
        }
    }

    /// Install a full tab list, returning leaves then joins against the old one
    fn replace_known_tabs(&self, tabs: Vec<TabInfo>) -> Vec<TabEvent> {
        let mut known = self.known_tabs.write();
        let mut changes: Vec<TabEvent> = known
            .iter()
            .filter(|old| !tabs.iter().any(|tab| tab.tab_id() == old.tab_id()))
            .map(|old| TabEvent::Left(old.tab_id().to_string()))
            .collect();
        changes.extend(
            tabs.iter()
                .filter(|tab| !known.iter().any(|old| old.tab_id() == tab.tab_id()))
                .cloned()
                .map(TabEvent::Joined),
        );
        *known = tabs;
        changes
    }

    async fn run_session(
        &self,
        mut session: Session,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let period = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let end = loop {
            tokio::select! {
                line = session.lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line),
                    Ok(None) => break SessionEnd::Lost,
                    Err(e) => {
                        tracing::warn!(transport = %self.name, "hub read failed: {}", e);
                        break SessionEnd::Lost;
                    }
                },
                _ = heartbeat.tick() => {
                    if session.writer.send(Outbound::Frame(HubFrame::Heartbeat)).is_err() {
                        break SessionEnd::Lost;
                    }
                }
                _ = shutdown.changed() => {
                    let _ = session.writer.send(Outbound::Frame(HubFrame::Unregister));
                    break SessionEnd::Shutdown;
                }
            }
        };

        self.link.lock().writer = None;
        self.requests.lock().clear();
        drop(session.writer);
        // The writer finishes what it holds, or hands back what it could not write
        let unsent =
            match tokio::time::timeout(Duration::from_millis(100), &mut session.writer_task).await {
                Ok(Ok(unsent)) => unsent,
                _ => {
                    session.writer_task.abort();
                    Vec::new()
                }
            };
        if !unsent.is_empty() && matches!(end, SessionEnd::Lost) {
            tracing::debug!(transport = %self.name, count = unsent.len(), "requeued unsent messages");
            let evicted = self.link.lock().queue.requeue_front(unsent);
            let handler = self.overflow.read().clone();
            for message in &evicted {
                report_overflow(&self.name, message, &self.counters, handler.clone());
            }
        }
        end
    }

    fn handle_line(&self, line: &str) {
        let frame = match HubFrame::decode(line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(transport = %self.name, "malformed hub frame: {}", e);
                return;
            }
        };

        match frame {
            HubFrame::Message { payload } => {
                let bytes = match serde_json::to_vec(&payload) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(e) => {
                        tracing::warn!(transport = %self.name, "hub payload encode failed: {}", e);
                        return;
                    }
                };
                self.counters.record_received();
                let handler = self.handler.read().clone();
                if let Some(handler) = handler {
                    handler(bytes);
                }
            }
            HubFrame::TabJoined { tab } => {
                {
                    let mut tabs = self.known_tabs.write();
                    tabs.retain(|t| t.tab_id() != tab.tab_id());
                    tabs.push(tab.clone());
                }
                self.emit_tab_event(TabEvent::Joined(tab));
            }
            HubFrame::TabLeft { tab_id } => {
                self.known_tabs.write().retain(|t| t.tab_id() != tab_id);
                self.emit_tab_event(TabEvent::Left(tab_id));
            }
            HubFrame::StateValue {
                request_id, value, ..
            } => {
                if let Some(tx) = self.requests.lock().remove(&request_id) {
                    let _ = tx.send(value);
                }
            }
            HubFrame::Registered { tabs } => {
                for event in self.replace_known_tabs(tabs) {
                    self.emit_tab_event(event);
                }
            }
            HubFrame::HeartbeatAck => {
                tracing::trace!(transport = %self.name, "heartbeat ack");
            }
            HubFrame::Error { message } => {
                tracing::warn!(transport = %self.name, "hub error: {}", message);
            }
            other => {
                tracing::debug!(transport = %self.name, frame = ?other, "ignoring hub frame");
            }
        }
    }

    fn emit_tab_event(&self, event: TabEvent) {
        let handler = self.tab_handler.read().clone();
        if let Some(handler) = handler {
            handler(event);
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
                Ok(session) => {
                    attempt = 0;
                    self.activate(&session);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                    if let SessionEnd::Shutdown = self.run_session(session, &mut shutdown).await {
                        break;
                    }
                    tracing::warn!(transport = %self.name, "hub session lost");
                }
                Err(e) => {
                    tracing::warn!(transport = %self.name, "hub connect failed: {}", e);
                    // A hub that was never reachable is treated as absent
                    if let Some(ready) = ready.take() {
                        self.teardown();
                        let _ = ready.send(Err(e));
                        return;
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
            attempt += 1;
            self.set_state(ConnectionState::Reconnecting { attempt });
            let delay = Duration::from_millis(self.config.reconnect_delay_ms);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.teardown();
    }

    fn teardown(&self) {
        {
            let mut link = self.link.lock();
            link.writer = None;
            link.task = None;
            link.shutdown = None;
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

#[async_trait]
impl Transport for HubTransport {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn scope(&self) -> SyncScope {
        SyncScope::Device
    }

    fn send(&self, message: &RuntimeMessage) -> TransportResult<()> {
        let mut link = self.inner.link.lock();
        if link.state.is_connected() {
            if let Some(writer) = &link.writer {
                if writer.send(Outbound::Message(message.clone())).is_ok() {
                    self.inner.counters.record_sent();
                    return Ok(());
                }
            }
        } else if !link.state.is_pending() {
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
            Err(_) => Err(TransportError::ConnectionFailed("hub supervisor stopped".into())),
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

impl std::fmt::Debug for HubTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubTransport")
            .field("name", &self.inner.name)
            .field("endpoint", &self.inner.endpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HubBroker, HubBrokerConfig};
    use serde_json::json;
    use tabmesh_wire::{create_message, Channel, MessageParams};

    fn identity(tab: &str) -> Identity {
        Identity::new("dev".into(), tab.into(), "ses".into())
    }

    fn in_process(broker: &HubBroker, tab: &str) -> (HubTransport, mpsc::UnboundedReceiver<Bytes>) {
        let transport = HubTransport::new(
            identity(tab),
            HubEndpoint::InProcess(broker.clone()),
            HubConfig::default(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        transport.on_message(Arc::new(move |bytes| {
            let _ = tx.send(bytes);
        }));
        (transport, rx)
    }

    fn message_from(tab: &str, n: u64) -> RuntimeMessage {
        create_message(MessageParams::new(Channel::Events, "emit_event"), &identity(tab), n)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> RuntimeMessage {
        let bytes = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        RuntimeMessage::decode(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_route() {
        let broker = HubBroker::new(HubBrokerConfig::default());
        let (a, _rx_a) = in_process(&broker, "tab-a");
        let (b, mut rx_b) = in_process(&broker, "tab-b");
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        assert!(a.is_connected());
        assert_eq!(b.known_tabs().len(), 1);

        let msg = message_from("tab-a", 1);
        a.send(&msg).unwrap();
        assert_eq!(recv(&mut rx_b).await.id, msg.id);
    }

    #[tokio::test]
    async fn test_send_before_connect_refused() {
        let broker = HubBroker::new(HubBrokerConfig::default());
        let (a, _) = in_process(&broker, "tab-a");
        assert!(!a.accepts_outbound());
        assert!(matches!(
            a.send(&message_from("tab-a", 0)),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_pre_handshake_buffer_flushed_in_order() {
        let broker = HubBroker::new(HubBrokerConfig::default());
        let (a, _) = in_process(&broker, "tab-a");
        let (b, mut rx_b) = in_process(&broker, "tab-b");
        b.connect().await.unwrap();

        // Put the link into its handshake phase by hand
        a.inner.link.lock().state = ConnectionState::Connecting;
        let first = message_from("tab-a", 1);
        let second = message_from("tab-a", 2);
        a.send(&first).unwrap();
        a.send(&second).unwrap();
        assert_eq!(a.stats().queued, 2);
        a.inner.link.lock().state = ConnectionState::Disconnected;

        a.connect().await.unwrap();
        assert_eq!(recv(&mut rx_b).await.id, first.id);
        assert_eq!(recv(&mut rx_b).await.id, second.id);
        assert_eq!(a.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_shared_state_and_tab_events() {
        let broker = HubBroker::new(HubBrokerConfig::default());
        let (a, _) = in_process(&broker, "tab-a");
        let (b, _) = in_process(&broker, "tab-b");

        let (events_tx, mut events) = mpsc::unbounded_channel();
        a.on_tab_event(Arc::new(move |event| {
            let _ = events_tx.send(event);
        }));
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(joined, TabEvent::Joined(ref tab) if tab.tab_id() == "tab-b"));

        a.set_shared_state("layout", json!({"split": true})).unwrap();
        // Same stream as the write, so the broker has applied it
        assert_eq!(a.get_shared_state("layout").await.unwrap(), Some(json!({"split": true})));
        let value = b.get_shared_state("layout").await.unwrap();
        assert_eq!(value, Some(json!({"split": true})));
        assert_eq!(b.get_shared_state("missing").await.unwrap(), None);

        b.disconnect().await;
        let left = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(left, TabEvent::Left("tab-b".into()));
        assert!(a.known_tabs().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_hub_reports_failure() {
        let transport = HubTransport::tcp(
            identity("tab-a"),
            HubConfig::default().with_addr("127.0.0.1:1"),
        );
        assert!(transport.connect().await.is_err());
        tokio::task::yield_now().await;
        assert!(!transport.accepts_outbound());
    }

    #[tokio::test]
    async fn test_failed_write_hands_back_unsent_messages() {
        let (sink, peer) = tokio::io::duplex(1024);
        drop(peer);
        let (tx, rx) = mpsc::unbounded_channel();
        let first = message_from("tab-a", 1);
        let second = message_from("tab-a", 2);
        tx.send(Outbound::Frame(HubFrame::Heartbeat)).unwrap();
        tx.send(Outbound::Message(first.clone())).unwrap();
        tx.send(Outbound::Message(second.clone())).unwrap();

        let unsent = write_loop("hub".into(), rx, sink).await;
        let ids: Vec<_> = unsent.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(tx.send(Outbound::Frame(HubFrame::Heartbeat)).is_err());
    }

    #[tokio::test]
    async fn test_reconnect_reports_tabs_gone_during_outage() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let hub = tokio::spawn(async move {
            // First broker knows tab-c, then goes away
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = tokio::io::split(stream);
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.unwrap();
            let sibling = TabInfo { identity: identity("tab-c"), joined_at: 1 };
            HubFrame::Registered { tabs: vec![sibling] }
                .write_to(&mut write)
                .await
                .unwrap();
            drop(lines);
            drop(write);

            // Restarted broker has no other tabs
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = tokio::io::split(stream);
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.unwrap();
            HubFrame::Registered { tabs: vec![] }.write_to(&mut write).await.unwrap();
            (lines, write)
        });

        let transport = HubTransport::tcp(
            identity("tab-a"),
            HubConfig::default().with_addr(addr).with_reconnect_delay(10),
        );
        let (tx, mut events) = mpsc::unbounded_channel();
        transport.on_tab_event(Arc::new(move |event| {
            let _ = tx.send(event);
        }));
        transport.connect().await.unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(joined, TabEvent::Joined(ref tab) if tab.tab_id() == "tab-c"));
        let left = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(left, TabEvent::Left("tab-c".into()));
        assert!(transport.known_tabs().is_empty());

        let _broker = hub.await.unwrap();
        transport.disconnect().await;
    }

    #[test]
    fn test_registered_list_diffs_against_known_tabs() {
        let transport = HubTransport::tcp(identity("tab-a"), HubConfig::default());
        let tab = |id: &str| TabInfo { identity: identity(id), joined_at: 1 };
        let first = transport.inner.replace_known_tabs(vec![tab("tab-b"), tab("tab-c")]);
        assert_eq!(first.len(), 2);

        let changes = transport.inner.replace_known_tabs(vec![tab("tab-c"), tab("tab-d")]);
        assert_eq!(
            changes,
            vec![TabEvent::Left("tab-b".into()), TabEvent::Joined(tab("tab-d"))]
        );
        assert_eq!(transport.known_tabs().len(), 2);
    }
}
