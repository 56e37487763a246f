//! Local activity state machine
//!
//! active -> idle after `idle_timeout_ms` without input, -> away after
//! `away_timeout_ms`. A hidden page is away immediately. Any input returns to
//! active.

use crate::PresenceStatus;

#[derive(Clone, Debug)]
pub struct ActivityTracker {
    idle_timeout_ms: u64,
    away_timeout_ms: u64,
    last_activity_ms: u64,
    hidden: bool,
    status: PresenceStatus,
}

impl ActivityTracker {
    pub fn new(idle_timeout_ms: u64, away_timeout_ms: u64, now_ms: u64) -> Self {
        ActivityTracker {
            idle_timeout_ms,
            away_timeout_ms: away_timeout_ms.max(idle_timeout_ms),
            last_activity_ms: now_ms,
            hidden: false,
            status: PresenceStatus::Active,
        }
    }

    pub fn status(&self) -> PresenceStatus {
        self.status
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms
    }

    /// Any input signal. Returns the new status if it changed. A hidden page
    /// stays away until it is shown again.
    pub fn record_activity(&mut self, now_ms: u64) -> Option<PresenceStatus> {
        self.last_activity_ms = now_ms;
        if self.hidden {
            return None;
        }
        self.transition(PresenceStatus::Active)
    }

    pub fn set_hidden(&mut self, hidden: bool, now_ms: u64) -> Option<PresenceStatus> {
        self.hidden = hidden;
        if hidden {
            self.transition(PresenceStatus::Away)
        } else {
            self.record_activity(now_ms)
        }
    }

    /// Periodic reclassification
    pub fn tick(&mut self, now_ms: u64) -> Option<PresenceStatus> {
        let quiet = now_ms.saturating_sub(self.last_activity_ms);
        let next = if self.hidden || quiet >= self.away_timeout_ms {
            PresenceStatus::Away
        } else if quiet >= self.idle_timeout_ms {
            PresenceStatus::Idle
        } else {
            PresenceStatus::Active
        };
        self.transition(next)
    }

    fn transition(&mut self, next: PresenceStatus) -> Option<PresenceStatus> {
        if self.status == next {
            return None;
        }
        self.status = next;
        Some(next)
    }
}
