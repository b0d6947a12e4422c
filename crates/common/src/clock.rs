//! Injectable wall clock.
//!
//! Expiry computation, the expiry sweep, unread-count TTLs and the rate
//! limiter all read time through [`Clock`] so tests can move time forward
//! without sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    current_millis: AtomicI64,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current_millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// Creates a clock frozen at the current system time.
    #[must_use]
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.current_millis
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        self.current_millis
            .store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.current_millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn now_millis(&self) -> i64 {
        self.current_millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::days(31));
        assert_eq!(clock.now(), start + Duration::days(31));
        assert_eq!(clock.now_millis(), (start + Duration::days(31)).timestamp_millis());
    }

    #[test]
    fn test_system_clock_moves() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
