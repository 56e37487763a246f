//! Transport errors

use tabmesh_core::MeshError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Unsupported environment: {0}")]
    Unsupported(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Reconnect attempts exhausted after {0} tries")]
    Exhausted(u32),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}

impl From<tabmesh_wire::WireError> for TransportError {
    fn from(err: tabmesh_wire::WireError) -> Self {
        TransportError::Codec(err.to_string())
    }
}

impl From<TransportError> for MeshError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionFailed(reason) => MeshError::ConnectionFailed(reason),
            TransportError::NotConnected => MeshError::NotConnected,
            TransportError::Unsupported(reason) => MeshError::TransportUnavailable(reason),
            TransportError::AuthFailed(reason) => MeshError::AuthFailed(reason),
            TransportError::Handshake(reason) => MeshError::HandshakeFailed(reason),
            TransportError::Timeout(what) => MeshError::Timeout(what.to_string()),
            TransportError::Exhausted(n) => MeshError::ReconnectExhausted(n),
            TransportError::Codec(reason) => MeshError::Codec(reason),
            other => MeshError::SendFailed {
                transport: String::new(),
                reason: other.to_string(),
            },
        }
    }
}
