//! Tabmesh Policy Engine - What gets shared, and how aggressively
//!
//! Policies are pure data:
//! - `EventSyncPolicy`: which contexts an event type reaches, and its throttle
//! - `StateSyncPolicy`: scope, conflict strategy and private fields of a state type
//!
//! Lookup is exact key first, then `namespace:*`, then a conservative
//! default. Runtime registrations outrank the built-in tables.

pub mod policy;
pub mod pattern;
pub mod builtin;
pub mod registry;
pub mod filter;

pub use policy::*;
pub use pattern::*;
pub use builtin::*;
pub use registry::*;
pub use filter::*;
