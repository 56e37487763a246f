//! State errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Unknown operation: {0}")]
    UnknownOp(String),

    #[error("Operation already pending: {0}")]
    DuplicateOp(String),

    #[error("Operation {0} already settled")]
    AlreadySettled(String),

    #[error("Invalid state payload: {0}")]
    InvalidPayload(String),
}

pub type StateResult<T> = Result<T, StateError>;
