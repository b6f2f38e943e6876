//! Clock and age abstraction.
//!
//! Every timer in the database is an [`Age`]: a duration since the database's
//! `time_zero`. Replicas move `time_zero` when they resynchronize with the leader,
//! which rebases all timers at once without touching them.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Duration since the database time zero.
pub type Age = Duration;

/// An age that is never reached. Used as "no deadline".
pub const AGE_NEVER: Age = Duration::MAX;

/// Source of monotonic time for a manager.
pub trait QuiesceClock: Send + Sync + 'static {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// The process monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl QuiesceClock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
///
/// Used to drive timeouts deterministically.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        ManualClock {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset = offset.saturating_add(by);
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl QuiesceClock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }
}

/// Absolute distance between two instants.
pub fn time_distance(lhs: Instant, rhs: Instant) -> Duration {
    if lhs > rhs {
        lhs - rhs
    } else {
        rhs - lhs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_only_on_demand() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);

        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.now() - t0, Duration::from_secs(3));
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn test_age_arithmetic_saturates_at_never() {
        let age = Duration::from_secs(10);
        assert_eq!(age.saturating_add(AGE_NEVER), AGE_NEVER);
        assert_eq!(AGE_NEVER.saturating_add(Duration::from_secs(1)), AGE_NEVER);
    }

    #[test]
    fn test_time_distance_is_symmetric() {
        let clock = ManualClock::new();
        let a = clock.now();
        clock.advance(Duration::from_millis(1500));
        let b = clock.now();
        assert_eq!(time_distance(a, b), Duration::from_millis(1500));
        assert_eq!(time_distance(b, a), Duration::from_millis(1500));
    }
}
