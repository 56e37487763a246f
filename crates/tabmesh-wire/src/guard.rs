//! Loop guard checks
//!
//! The guard is append-only: every context that processes a message adds
//! its own id exactly once before re-forwarding. This makes mesh relaying
//! between transports safe without a central sequence authority.

use crate::RuntimeMessage;

/// Hard cap against runaway relay loops
pub const MAX_HOP_COUNT: u32 = 10;

/// Outcome of a loop-guard check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    AlreadySeen,
    Expired,
    HopLimit,
}

impl Verdict {
    #[inline]
    pub fn is_accept(self) -> bool {
        self == Verdict::Accept
    }
}

/// Classify a received message for `context_id`
pub fn check(message: &RuntimeMessage, context_id: &str, now_ms: u64) -> Verdict {
    if message.loop_guard.has_seen(context_id) {
        return Verdict::AlreadySeen;
    }
    if message.is_expired(now_ms) {
        return Verdict::Expired;
    }
    if message.loop_guard.hop_count > MAX_HOP_COUNT {
        return Verdict::HopLimit;
    }
    Verdict::Accept
}

/// Should `context_id` process this message?
///
/// Rejections are drops, never retries. The hop-limit case is logged since it
/// usually means a misconfigured route.
pub fn should_process(message: &RuntimeMessage, context_id: &str, now_ms: u64) -> bool {
    match check(message, context_id, now_ms) {
        Verdict::Accept => true,
        Verdict::HopLimit => {
            tracing::warn!(
                message_id = %message.id,
                hop_count = message.loop_guard.hop_count,
                origin = message.origin(),
                "dropping message over hop limit"
            );
            false
        }
        Verdict::AlreadySeen | Verdict::Expired => false,
    }
}

/// Return a new envelope with `context_id` appended and the hop count bumped
pub fn mark_seen(message: &RuntimeMessage, context_id: &str) -> RuntimeMessage {
    let mut next = message.clone();
    if !next.loop_guard.has_seen(context_id) {
        next.loop_guard.seen_by.push(context_id.to_string());
    }
    next.loop_guard.hop_count = next.loop_guard.hop_count.saturating_add(1);
    next
}
