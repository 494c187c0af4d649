//! Time helpers.
//!
//! Expiry decisions use monotonic [`Instant`]s that never leave the node.
//! Wall-clock milliseconds are only used for reporting and for heartbeat
//! timestamps.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The local instant that lies `age` in the past, clamped to now when the
/// monotonic clock cannot go back that far.
pub fn instant_ago(now: Instant, age: Duration) -> Instant {
    now.checked_sub(age).unwrap_or(now)
}

pub fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}
