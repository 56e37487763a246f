//! Tabmesh Test Harness - In-memory meshes and end-to-end scenarios
//!
//! This crate provides:
//! - Memory transports that record sends and share a synchronous medium
//! - A per-context harness on a manual clock
//! - End-to-end scenarios for throttling, loop prevention and relay

pub mod harness;
pub mod memory;

pub use harness::*;
pub use memory::*;

#[cfg(test)]
mod scenarios;
