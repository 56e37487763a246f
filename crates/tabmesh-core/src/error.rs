//! Error types for tabmesh

use thiserror::Error;

/// Core tabmesh errors
///
/// None of these are fatal to a dispatcher: inbound failures are logged and
/// dropped, outbound failures are logged per transport.
#[derive(Error, Debug)]
pub enum MeshError {
    // Input errors
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u64),

    // Transport errors
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Send failed on {transport}: {reason}")]
    SendFailed { transport: String, reason: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Hub handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not connected")]
    NotConnected,

    // Registry errors
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Codec error: {0}")]
    Codec(String),

    // Setup errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for tabmesh operations
pub type MeshResult<T> = Result<T, MeshError>;
