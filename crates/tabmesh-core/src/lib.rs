//! Tabmesh Core - Fundamental types and primitives
//!
//! This crate defines the core types used throughout the tabmesh sync engine:
//! - Identifiers (DeviceId, TabId, SessionId) and the identity provider
//! - Sync scopes and their ordering
//! - Wall clocks (system and manual)
//! - The shared error taxonomy

pub mod id;
pub mod scope;
pub mod time;
pub mod error;

pub use id::*;
pub use scope::*;
pub use time::*;
pub use error::*;
