//! Socket connectors
//!
//! `WsConnector` dials real WebSocket servers. `MemoryConnector` hands the
//! server side of each connection to a test via `MemoryServer`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::NetFrame;
use crate::{TransportError, TransportResult};

/// An open duplex text socket
#[async_trait]
pub trait NetworkSocket: Send {
    async fn send_text(&mut self, text: String) -> TransportResult<()>;

    /// Next text frame; `None` once the peer has closed
    async fn recv_text(&mut self) -> Option<TransportResult<String>>;

    async fn close(&mut self) -> TransportResult<()>;
}

/// Opens sockets to a URL
#[async_trait]
pub trait NetworkConnector: Send + Sync {
    async fn connect(&self, url: &str) -> TransportResult<Box<dyn NetworkSocket>>;
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct WsSocket {
    ws: WsStream,
}

#[async_trait]
impl NetworkSocket for WsSocket {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv_text(&mut self) -> Option<TransportResult<String>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(data)) => {
                    return Some(
                        String::from_utf8(data.to_vec())
                            .map_err(|e| TransportError::Codec(e.to_string())),
                    )
                }
                Ok(Message::Close(_)) => return None,
                // Pings are answered by tungstenite itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(TransportError::ConnectionFailed(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.ws
            .close(None)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl NetworkConnector for WsConnector {
    async fn connect(&self, url: &str) -> TransportResult<Box<dyn NetworkSocket>> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Box::new(WsSocket { ws }))
    }
}

struct MemorySocket {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl NetworkSocket for MemorySocket {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        self.outgoing
            .send(text)
            .map_err(|_| TransportError::SendFailed("peer closed".into()))
    }

    async fn recv_text(&mut self) -> Option<TransportResult<String>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.incoming.close();
        Ok(())
    }
}

/// Server end of one in-memory connection
#[derive(Debug)]
pub struct MemorySocketPeer {
    pub url: String,
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemorySocketPeer {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }

    pub fn send_frame(&self, frame: &NetFrame) -> bool {
        match frame.encode() {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next frame from the client, skipping undecodable text
    pub async fn recv_frame(&mut self) -> Option<NetFrame> {
        loop {
            let text = self.from_client.recv().await?;
            if let Ok(frame) = NetFrame::decode(&text) {
                return Some(frame);
            }
        }
    }

    /// Next frame that is not a heartbeat; heartbeats are acknowledged
    pub async fn recv_non_heartbeat(&mut self) -> Option<NetFrame> {
        loop {
            match self.recv_frame().await? {
                NetFrame::Heartbeat { timestamp } => {
                    self.send_frame(&NetFrame::HeartbeatAck { timestamp });
                }
                frame => return Some(frame),
            }
        }
    }
}

/// Accepts in-memory connections
#[derive(Debug)]
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<MemorySocketPeer>,
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<MemorySocketPeer> {
        self.accept_rx.recv().await
    }
}

struct MemoryConnectorInner {
    accept_tx: mpsc::UnboundedSender<MemorySocketPeer>,
    refuse: AtomicBool,
    dialed: Mutex<Vec<String>>,
}

/// In-process connector for tests and embedding
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<MemoryConnectorInner>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let connector = MemoryConnector {
            inner: Arc::new(MemoryConnectorInner {
                accept_tx,
                refuse: AtomicBool::new(false),
                dialed: Mutex::new(Vec::new()),
            }),
        };
        (connector, MemoryServer { accept_rx })
    }

    /// Make subsequent connects fail
    pub fn set_refuse(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::Release);
    }

    /// Every URL dialed so far, refused or not
    pub fn dialed_urls(&self) -> Vec<String> {
        self.inner.dialed.lock().clone()
    }
}

#[async_trait]
impl NetworkConnector for MemoryConnector {
    async fn connect(&self, url: &str) -> TransportResult<Box<dyn NetworkSocket>> {
        self.inner.dialed.lock().push(url.to_string());
        if self.inner.refuse.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionFailed("connection refused".into()));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let peer = MemorySocketPeer {
            url: url.to_string(),
            to_client,
            from_client,
        };
        self.inner
            .accept_tx
            .send(peer)
            .map_err(|_| TransportError::ConnectionFailed("server gone".into()))?;
        Ok(Box::new(MemorySocket { outgoing, incoming }))
    }
}
