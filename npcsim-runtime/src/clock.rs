//! Time sources for the scheduler.
//!
//! The core never reads the wall clock; every cycle takes an explicit `now`.
//! The scheduler asks a [`Clock`] for it, so tests and replays can drive
//! simulated time with a [`ManualClock`].

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use npcsim_core::types::{Timestamp, hours};

/// Source of "now" for simulation cycles.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current simulation time.
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Manually advanced time, shareable across tasks.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    /// A clock frozen at `start`.
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move time forward by `h` hours and return the new time.
    pub fn advance_hours(&self, h: f64) -> Timestamp {
        let mut now = self.now.lock();
        *now += hours(h);
        *now
    }

    /// Jump to `at`. Going backwards is ignored.
    pub fn set(&self, at: Timestamp) {
        let mut now = self.now.lock();
        if at > *now {
            *now = at;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_is_shared_and_monotonic() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid");
        let clock = ManualClock::new(start);
        let other = clock.clone();

        let later = clock.advance_hours(1.5);
        assert_eq!(other.now(), later);

        other.set(start);
        assert_eq!(clock.now(), later);
    }
}
