//! DTN time and the clock abstraction.
//!
//! DTN time is milliseconds since 2000-01-01T00:00:00Z (RFC 9171 §4.2.6).
//! All blocking operations in the cache take *absolute* DTN-time deadlines;
//! [`DtnTime::INFINITE`] requests no deadline at all.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Offset of the DTN epoch (2000-01-01T00:00:00Z) from the Unix epoch.
pub const DTN_EPOCH_UNIX_SECS: u64 = 946_684_800;

/// An absolute DTN timestamp in milliseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DtnTime(u64);

impl DtnTime {
    /// Sentinel meaning "no deadline" / "never".
    pub const INFINITE: DtnTime = DtnTime(u64::MAX);

    pub const fn from_ms(ms: u64) -> Self {
        DtnTime(ms)
    }

    pub const fn ms(self) -> u64 {
        self.0
    }

    /// Add a millisecond interval, saturating at [`DtnTime::INFINITE`].
    pub const fn offset(self, interval_ms: u64) -> Self {
        DtnTime(self.0.saturating_add(interval_ms))
    }

    /// Milliseconds until `deadline`, or zero if it already passed.
    pub const fn until(self, deadline: DtnTime) -> u64 {
        deadline.0.saturating_sub(self.0)
    }
}

/// Source of DTN wall-clock time.
///
/// The cache never reads the system clock directly; everything timer-driven
/// goes through this trait so tests can run on a hand-advanced clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DtnTime;
}

/// Real wall clock, derived from `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DtnTime {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let unix_ms = since_unix.as_millis() as u64;
        DtnTime::from_ms(unix_ms.saturating_sub(DTN_EPOCH_UNIX_SECS * 1000))
    }
}

/// Manually-advanced clock for tests and simulation.
#[derive(Debug, Default)]
pub struct SimClock {
    now_ms: AtomicU64,
}

impl SimClock {
    pub fn new(start: DtnTime) -> Self {
        SimClock {
            now_ms: AtomicU64::new(start.ms()),
        }
    }

    pub fn set(&self, t: DtnTime) {
        self.now_ms.store(t.ms(), Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now(&self) -> DtnTime {
        DtnTime::from_ms(self.now_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_saturates_at_infinite() {
        assert_eq!(DtnTime::INFINITE.offset(1), DtnTime::INFINITE);
        assert_eq!(DtnTime::from_ms(5).offset(10), DtnTime::from_ms(15));
    }

    #[test]
    fn until_is_zero_for_past_deadlines() {
        let now = DtnTime::from_ms(1000);
        assert_eq!(now.until(DtnTime::from_ms(400)), 0);
        assert_eq!(now.until(DtnTime::from_ms(1400)), 400);
    }

    #[test]
    fn sim_clock_advances() {
        let clock = SimClock::new(DtnTime::from_ms(100));
        assert_eq!(clock.now(), DtnTime::from_ms(100));
        clock.advance(50);
        assert_eq!(clock.now(), DtnTime::from_ms(150));
    }

    #[test]
    fn system_clock_is_past_dtn_epoch() {
        assert!(SystemClock.now().ms() > 0);
    }
}


