//! Wall-clock helpers
//!
//! Persisted timestamps (usage records, job rows, cache entries, credential
//! expiry) are unix milliseconds. In-memory deadlines use `Instant` instead.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Duration as whole milliseconds, saturating at `u64::MAX`.
pub fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
