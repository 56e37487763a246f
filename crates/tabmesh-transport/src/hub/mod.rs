//! Per-device hub
//!
//! A long-lived broker that outlives individual tabs. Tabs register over a
//! newline-delimited JSON stream; the broker routes messages between them,
//! tracks join/leave, holds messages for tabs that are mid-reconnect, and
//! serves a small shared key/value store.

mod broker;
mod client;
mod frame;

use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

pub use broker::{HubBroker, HubBrokerConfig};
pub use client::{HubTransport, TabEvent, TabEventHandler};
pub use frame::{HubFrame, TabInfo};

use crate::{TransportError, TransportResult};

/// Hub client settings
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct HubConfig {
    /// TCP address of the broker
    pub addr: String,
    pub heartbeat_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Timeout for shared state reads
    pub request_timeout_ms: u64,
    /// Delay between attempts after an established session drops
    pub reconnect_delay_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            addr: "127.0.0.1:7420".to_string(),
            heartbeat_interval_ms: 5_000,
            handshake_timeout_ms: 3_000,
            request_timeout_ms: 3_000,
            reconnect_delay_ms: 1_000,
        }
    }
}

impl HubConfig {
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_handshake_timeout(mut self, ms: u64) -> Self {
        self.handshake_timeout_ms = ms;
        self
    }

    pub fn with_reconnect_delay(mut self, ms: u64) -> Self {
        self.reconnect_delay_ms = ms;
        self
    }
}

/// Where a hub client finds its broker
#[derive(Clone)]
pub enum HubEndpoint {
    Tcp(String),
    /// Broker embedded in this process
    InProcess(HubBroker),
}

impl HubEndpoint {
    pub(crate) async fn open(&self) -> TransportResult<HubStream> {
        match self {
            HubEndpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;
                stream.set_nodelay(true)?;
                Ok(HubStream::Tcp(stream))
            }
            HubEndpoint::InProcess(broker) => Ok(HubStream::Duplex(broker.connect_in_process())),
        }
    }
}

impl std::fmt::Debug for HubEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubEndpoint::Tcp(addr) => write!(f, "Tcp({})", addr),
            HubEndpoint::InProcess(_) => f.write_str("InProcess"),
        }
    }
}

/// Client side of a broker connection
pub(crate) enum HubStream {
    Tcp(TcpStream),
    Duplex(DuplexStream),
}

impl AsyncRead for HubStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            HubStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            HubStream::Duplex(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HubStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            HubStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            HubStream::Duplex(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            HubStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            HubStream::Duplex(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            HubStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            HubStream::Duplex(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
