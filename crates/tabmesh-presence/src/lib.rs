//! Tabmesh Presence - Who is here and what they are doing
//!
//! This crate provides:
//! - `PresenceEntry` and the activity status of each participant
//! - `ActivityTracker` for the local active/idle/away state machine
//! - `CursorTrack` interpolation for smooth remote cursors
//! - `PresenceManager` merging hub, tab and network presence sources

pub mod activity;
pub mod entry;
pub mod interpolation;
pub mod manager;

pub use activity::*;
pub use entry::*;
pub use interpolation::*;
pub use manager::*;
