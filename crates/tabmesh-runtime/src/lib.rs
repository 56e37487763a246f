//! Tabmesh Runtime - Dispatch and context wiring
//!
//! This crate ties the lower layers together:
//! - `Dispatcher`: policy resolution, throttling, scope-based fan-out,
//!   inbound validation, dedup and mesh relay
//! - `Throttle`: trailing-edge coalescing keyed by string
//! - `SyncContext`: one explicitly constructed context per tab
//! - `EventBridge`: glue between a local event bus and the dispatcher
//! - Logging initialization for binaries and hosts

pub mod bridge;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod seen;
pub mod telemetry;
pub mod throttle;

pub use bridge::*;
pub use config::*;
pub use context::*;
pub use dispatcher::*;
pub use seen::*;
pub use telemetry::{init_logging, LogConfig};
pub use throttle::*;
