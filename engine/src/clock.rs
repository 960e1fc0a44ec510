//! Time sources for stamping writes and scheduling retries.
//!
//! All engine timestamps are milliseconds since the Unix epoch. The clock is
//! injected so that backoff windows and write stamps are deterministic in
//! tests.

use crate::Timestamp;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds since the Unix epoch.
    fn now(&self) -> Timestamp;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Stamp for a local write that replaces `previous`.
///
/// The result is strictly greater than the previous stamp even if the wall
/// clock went backwards, so successive local writes to one record never tie.
pub fn write_stamp(now: Timestamp, previous: Option<Timestamp>) -> Timestamp {
    match previous {
        Some(prev) => now.max(prev.saturating_add(1)),
        None => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(250);
        assert_eq!(clock.now(), 1_250);
        clock.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[test]
    fn system_clock_is_past_2020() {
        assert!(SystemClock.now() > 1_577_836_800_000);
    }

    #[test]
    fn write_stamp_uses_now_for_fresh_records() {
        assert_eq!(write_stamp(1_000, None), 1_000);
    }

    #[test]
    fn write_stamp_never_ties_or_regresses() {
        assert_eq!(write_stamp(2_000, Some(1_000)), 2_000);
        assert_eq!(write_stamp(1_000, Some(1_000)), 1_001);
        // wall clock went backwards
        assert_eq!(write_stamp(900, Some(1_000)), 1_001);
    }
}
