//! Tabmesh Wire Protocol - Message envelope and loop guard
//!
//! This crate implements the envelope carried by every message:
//! - `RuntimeMessage` with routing metadata and payload
//! - Loop guard (seen-by list, hop count, TTL)
//! - JSON codec with structural validation
//! - The standard message type vocabulary

pub mod error;
pub mod message;
pub mod guard;
pub mod codec;
pub mod types;

pub use error::*;
pub use message::*;
pub use guard::*;
pub use codec::*;
