//! Monotonic time for the scheduler.
//!
//! Scheduling decisions are made against [`TimeTicks`], a monotonic
//! timestamp measured from an arbitrary origin, rather than `Instant`,
//! so that tests can fabricate and advance time deterministically.

use core::ops::{Add, AddAssign};
use core::time::Duration;
use std::time::Instant;

/// A monotonic timestamp: the duration elapsed since the clock's origin.
///
/// The origin is arbitrary and only differences between ticks are
/// meaningful. Subtraction saturates at zero, so a clock that appears to
/// run backwards yields a zero delta instead of panicking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct TimeTicks(Duration);

impl TimeTicks {
    /// The clock origin.
    pub const ZERO: Self = Self(Duration::ZERO);

    /// Time elapsed since `earlier`, saturating at zero if `earlier` is in
    /// the future.
    #[must_use]
    pub fn duration_since(self, earlier: Self) -> Duration {
        self.0.checked_sub(earlier.0).unwrap_or_default()
    }

    /// The offset from the clock origin.
    #[must_use]
    pub const fn since_origin(self) -> Duration {
        self.0
    }
}

impl Add<Duration> for TimeTicks {
    type Output = Self;

    fn add(self, delta: Duration) -> Self {
        Self(self.0.saturating_add(delta))
    }
}

impl AddAssign<Duration> for TimeTicks {
    fn add_assign(&mut self, delta: Duration) {
        self.0 = self.0.saturating_add(delta);
    }
}

/// A source of [`TimeTicks`], treated as ground truth for all scheduling.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> TimeTicks;
}

/// Production clock backed by `Instant`, with the origin fixed at
/// construction.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> TimeTicks {
        TimeTicks(self.origin.elapsed())
    }
}
