//! Hub broker
//!
//! Tab slots outlive their connections: a tab whose stream drops keeps its
//! slot (and accumulates a bounded pending queue) until its heartbeat lapses
//! and the sweep evicts it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tabmesh_core::{system_clock, Identity, SharedClock};

use crate::{HubFrame, TabInfo, TransportResult};

const DUPLEX_BUFFER: usize = 64 * 1024;

/// Broker settings
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct HubBrokerConfig {
    /// Tabs silent for longer than this are evicted
    pub heartbeat_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    /// Bound on messages held for a disconnected tab
    pub max_pending_per_tab: usize,
}

impl Default for HubBrokerConfig {
    fn default() -> Self {
        HubBrokerConfig {
            heartbeat_timeout_ms: 15_000,
            sweep_interval_ms: 5_000,
            max_pending_per_tab: 256,
        }
    }
}

type FrameSender = mpsc::UnboundedSender<HubFrame>;

struct TabSlot {
    info: TabInfo,
    conn: Option<(u64, FrameSender)>,
    last_seen_ms: u64,
    pending: VecDeque<HubFrame>,
}

impl TabSlot {
    /// Deliver now, or hold until the tab re-registers
    fn deliver(&mut self, frame: HubFrame, max_pending: usize) {
        let frame = match &self.conn {
            Some((_, tx)) => match tx.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(frame)) => {
                    self.conn = None;
                    frame
                }
            },
            None => frame,
        };
        if self.pending.len() >= max_pending {
            self.pending.pop_front();
            tracing::warn!(tab = %self.info.tab_id(), "hub pending queue full, dropped oldest");
        }
        self.pending.push_back(frame);
    }
}

#[derive(Default)]
struct BrokerState {
    tabs: HashMap<String, TabSlot>,
    shared: HashMap<String, Value>,
}

impl BrokerState {
    fn broadcast_except(&mut self, except: &str, frame: &HubFrame, max_pending: usize) {
        for (tab_id, slot) in self.tabs.iter_mut() {
            if tab_id != except {
                slot.deliver(frame.clone(), max_pending);
            }
        }
    }
}

struct BrokerInner {
    config: HubBrokerConfig,
    clock: SharedClock,
    state: Mutex<BrokerState>,
    next_conn: AtomicU64,
}

/// Routes frames between the tabs of one device
#[derive(Clone)]
pub struct HubBroker {
    inner: Arc<BrokerInner>,
}

impl HubBroker {
    pub fn new(config: HubBrokerConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: HubBrokerConfig, clock: SharedClock) -> Self {
        HubBroker {
            inner: Arc::new(BrokerInner {
                config,
                clock,
                state: Mutex::new(BrokerState::default()),
                next_conn: AtomicU64::new(1),
            }),
        }
    }

    /// Accept TCP connections until the listener fails
    pub async fn serve(&self, listener: TcpListener) -> TransportResult<()> {
        tracing::info!(addr = ?listener.local_addr().ok(), "hub broker listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("set_nodelay failed for {}: {}", peer, e);
            }
            tracing::debug!(%peer, "hub connection accepted");
            self.accept(stream);
        }
    }

    /// New in-process connection; returns the client end
    pub fn connect_in_process(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        self.accept(server);
        client
    }

    /// Serve one connection on its own task
    pub fn accept<S>(&self, stream: S) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let broker = self.clone();
        tokio::spawn(async move { broker.run_connection(stream).await })
    }

    /// Periodically evict tabs whose heartbeat lapsed
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let broker = self.clone();
        let period = Duration::from_millis(self.inner.config.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                broker.sweep();
            }
        })
    }

    /// Evict lapsed tabs now; returns the evicted tab ids
    pub fn sweep(&self) -> Vec<String> {
        let now = self.inner.clock.now_ms();
        let timeout = self.inner.config.heartbeat_timeout_ms;
        let max_pending = self.inner.config.max_pending_per_tab;
        let mut state = self.inner.state.lock();

        let evicted: Vec<String> = state
            .tabs
            .iter()
            .filter(|(_, slot)| now.saturating_sub(slot.last_seen_ms) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for tab_id in &evicted {
            state.tabs.remove(tab_id);
            tracing::info!(tab = %tab_id, "evicted tab after heartbeat lapse");
            let frame = HubFrame::TabLeft {
                tab_id: tab_id.clone(),
            };
            state.broadcast_except(tab_id, &frame, max_pending);
        }
        evicted
    }

    /// Currently registered tabs, connected or not
    pub fn tabs(&self) -> Vec<TabInfo> {
        let state = self.inner.state.lock();
        let mut tabs: Vec<TabInfo> = state.tabs.values().map(|s| s.info.clone()).collect();
        tabs.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.tab_id().cmp(b.tab_id())));
        tabs
    }

    pub fn shared_value(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().shared.get(key).cloned()
    }

    async fn run_connection<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn_id = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<HubFrame>();

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = frame.write_to(&mut write_half).await {
                    tracing::debug!("hub write failed: {}", e);
                    break;
                }
            }
        });

        let mut lines = BufReader::new(read_half).lines();
        let mut tab_id: Option<String> = None;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match HubFrame::decode(&line) {
                        Ok(frame) => self.handle_frame(conn_id, &tx, &mut tab_id, frame),
                        Err(e) => {
                            tracing::warn!("malformed hub frame: {}", e);
                            let _ = tx.send(HubFrame::Error {
                                message: "malformed frame".into(),
                            });
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("hub read failed: {}", e);
                    break;
                }
            }
        }

        if let Some(tab_id) = tab_id {
            self.detach(&tab_id, conn_id);
        }
    }

    fn handle_frame(
        &self,
        conn_id: u64,
        tx: &FrameSender,
        tab_id: &mut Option<String>,
        frame: HubFrame,
    ) {
        match frame {
            HubFrame::Register { identity } => {
                *tab_id = Some(identity.tab_id.as_str().to_string());
                self.register(conn_id, tx, identity);
            }
            HubFrame::Unregister => {
                if let Some(id) = tab_id.take() {
                    self.unregister(&id);
                }
            }
            frame => {
                let Some(id) = tab_id.as_deref() else {
                    let _ = tx.send(HubFrame::Error {
                        message: "not registered".into(),
                    });
                    return;
                };
                self.handle_registered(id, tx, frame);
            }
        }
    }

    fn register(&self, conn_id: u64, tx: &FrameSender, identity: Identity) {
        let now = self.inner.clock.now_ms();
        let max_pending = self.inner.config.max_pending_per_tab;
        let key = identity.tab_id.as_str().to_string();
        let mut state = self.inner.state.lock();

        let others: Vec<TabInfo> = state
            .tabs
            .iter()
            .filter(|(id, _)| **id != key)
            .map(|(_, slot)| slot.info.clone())
            .collect();
        let _ = tx.send(HubFrame::Registered { tabs: others });

        match state.tabs.get_mut(&key) {
            Some(slot) => {
                slot.conn = Some((conn_id, tx.clone()));
                slot.last_seen_ms = now;
                let pending = std::mem::take(&mut slot.pending);
                tracing::info!(tab = %key, pending = pending.len(), "tab re-registered");
                for frame in pending {
                    let _ = tx.send(frame);
                }
            }
            None => {
                let info = TabInfo {
                    identity,
                    joined_at: now,
                };
                tracing::info!(tab = %key, "tab registered");
                state.broadcast_except(&key, &HubFrame::TabJoined { tab: info.clone() }, max_pending);
                state.tabs.insert(
                    key,
                    TabSlot {
                        info,
                        conn: Some((conn_id, tx.clone())),
                        last_seen_ms: now,
                        pending: VecDeque::new(),
                    },
                );
            }
        }
    }

    fn unregister(&self, tab_id: &str) {
        let max_pending = self.inner.config.max_pending_per_tab;
        let mut state = self.inner.state.lock();
        if state.tabs.remove(tab_id).is_some() {
            tracing::info!(tab = %tab_id, "tab unregistered");
            let frame = HubFrame::TabLeft {
                tab_id: tab_id.to_string(),
            };
            state.broadcast_except(tab_id, &frame, max_pending);
        }
    }

    fn detach(&self, tab_id: &str, conn_id: u64) {
        let mut state = self.inner.state.lock();
        if let Some(slot) = state.tabs.get_mut(tab_id) {
            if matches!(slot.conn, Some((id, _)) if id == conn_id) {
                slot.conn = None;
                tracing::debug!(tab = %tab_id, "tab connection dropped, holding slot");
            }
        }
    }

    fn handle_registered(&self, tab_id: &str, tx: &FrameSender, frame: HubFrame) {
        let now = self.inner.clock.now_ms();
        let max_pending = self.inner.config.max_pending_per_tab;
        let mut state = self.inner.state.lock();
        if let Some(slot) = state.tabs.get_mut(tab_id) {
            slot.last_seen_ms = now;
        }

        match frame {
            HubFrame::Message { payload } => {
                state.broadcast_except(tab_id, &HubFrame::Message { payload }, max_pending);
            }
            HubFrame::Heartbeat => {
                let _ = tx.send(HubFrame::HeartbeatAck);
            }
            HubFrame::GetState { request_id, key } => {
                let value = state.shared.get(&key).cloned();
                let _ = tx.send(HubFrame::StateValue {
                    request_id,
                    key,
                    value,
                });
            }
            HubFrame::SetState { key, value } => {
                state.shared.insert(key, value);
            }
            other => {
                tracing::debug!(tab = %tab_id, frame = ?other, "ignoring unexpected hub frame");
            }
        }
    }
}

impl std::fmt::Debug for HubBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubBroker")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
