//! Tabmesh Transport Layer
//!
//! This crate provides:
//! - The `Transport` trait every delivery channel implements
//! - Local bus transport (same device, all tabs, in-process)
//! - Hub transport and broker (same device, survives tab close, shared K/V)
//! - Network transport (multi-device, room based, WebSocket)
//! - Bounded outbound queues with oldest-drop semantics

pub mod error;
pub mod transport;
pub mod queue;
pub mod local;
pub mod hub;
pub mod network;

pub use error::*;
pub use transport::*;
pub use queue::*;
pub use local::{LocalBus, LocalBusTransport};
pub use hub::{
    HubBroker, HubBrokerConfig, HubConfig, HubEndpoint, HubFrame, HubTransport, TabEvent,
    TabEventHandler, TabInfo,
};
pub use network::{
    backoff_delay, MemoryConnector, MemoryServer, MemorySocketPeer, NetFrame, NetworkConfig,
    NetworkConnector, NetworkSocket, NetworkTransport, PresenceHandler, ReconnectConfig,
    RemotePresence, WsConnector,
};
