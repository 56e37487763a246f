//! Sync scope definitions
//!
//! Scopes are totally ordered by breadth:
//! - Local: this context only
//! - Device: every context on this device
//! - User: every device of this user
//! - Canvas: every user sharing the canvas
//! - Global: everyone
//!
//! A transport with scope S may carry a message whose resolved target
//! scope is at most S.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SyncScope {
    #[default]
    Local = 0,
    Device = 1,
    User = 2,
    Canvas = 3,
    Global = 4,
}

impl SyncScope {
    pub const ALL: [SyncScope; 5] = [
        SyncScope::Local,
        SyncScope::Device,
        SyncScope::User,
        SyncScope::Canvas,
        SyncScope::Global,
    ];

    #[inline]
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(SyncScope::Local),
            1 => Some(SyncScope::Device),
            2 => Some(SyncScope::User),
            3 => Some(SyncScope::Canvas),
            4 => Some(SyncScope::Global),
            _ => None,
        }
    }

    /// Can something with this scope carry a message targeted at `target`?
    #[inline]
    pub fn covers(self, target: SyncScope) -> bool {
        target.rank() <= self.rank()
    }

    /// Does this scope leave the current context at all?
    #[inline]
    pub fn is_local(self) -> bool {
        self == SyncScope::Local
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncScope::Local => "local",
            SyncScope::Device => "device",
            SyncScope::User => "user",
            SyncScope::Canvas => "canvas",
            SyncScope::Global => "global",
        }
    }
}

impl fmt::Display for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
