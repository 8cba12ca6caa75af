//! Time sources for the update pipeline
//!
//! Retry timing runs on a monotonic clock so that wall-clock corrections
//! (NTP, RTC resync) never shorten or stretch a wait. Wall time is only used
//! for telemetry timestamps and the pause gate.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of monotonic and wall-clock time
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed epoch; never goes backwards
    fn monotonic(&self) -> Duration;

    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by [`Instant`] and the system wall clock
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    /// Create a clock whose monotonic epoch is the moment of creation
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.start.elapsed()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations
///
/// Both readings only change through [`advance`](Self::advance) and
/// [`set_wall`](Self::set_wall).
#[derive(Debug)]
pub struct ManualClock {
    monotonic_ms: AtomicU64,
    wall_ms: AtomicI64,
}

impl ManualClock {
    /// Create a clock at monotonic zero and the given wall time
    #[must_use]
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self {
            monotonic_ms: AtomicU64::new(0),
            wall_ms: AtomicI64::new(wall.timestamp_millis()),
        }
    }

    /// Move both readings forward
    pub fn advance(&self, by: Duration) {
        let ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.monotonic_ms.fetch_add(ms, Ordering::SeqCst);
        self.wall_ms
            .fetch_add(i64::try_from(ms).unwrap_or(i64::MAX), Ordering::SeqCst);
    }

    /// Jump the wall clock without touching monotonic time
    pub fn set_wall(&self, wall: DateTime<Utc>) {
        self.wall_ms.store(wall.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        Duration::from_millis(self.monotonic_ms.load(Ordering::SeqCst))
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.wall_ms.load(Ordering::SeqCst))
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance_moves_both_readings() {
        let start = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_millis(1500));

        assert_eq!(clock.monotonic(), Duration::from_millis(1500));
        assert_eq!((clock.now() - start).num_milliseconds(), 1500);
    }

    #[test]
    fn test_wall_jump_leaves_monotonic_alone() {
        let clock = ManualClock::new(DateTime::UNIX_EPOCH);
        clock.advance(Duration::from_secs(5));
        clock.set_wall(DateTime::UNIX_EPOCH);

        assert_eq!(clock.monotonic(), Duration::from_secs(5));
        assert_eq!(clock.now(), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.monotonic();
        let b = clock.monotonic();
        assert!(b >= a);
    }
}
