//! Tabmesh State - Shared state with per-type sync policies
//!
//! This crate provides:
//! - `StateStore`: local values reconciled per conflict strategy
//! - `OptimisticStore`: tentative writes that commit or roll back
//! - `StateSync`: policy gating, privacy filtering and dispatch

pub mod error;
pub mod optimistic;
pub mod store;
pub mod sync;

pub use error::*;
pub use optimistic::*;
pub use store::*;
pub use sync::*;
