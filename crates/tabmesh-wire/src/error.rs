//! Wire errors

use tabmesh_core::MeshError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope is not a JSON object")]
    NotAnObject,

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u64),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

pub type WireResult<T> = Result<T, WireError>;

impl From<WireError> for MeshError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::UnsupportedVersion(v) => MeshError::UnsupportedVersion(v),
            other => MeshError::Malformed(other.to_string()),
        }
    }
}
