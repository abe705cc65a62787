//! Clock sources used by the timer registry.
//!
//! Provides the [`Clock`] trait and its two implementations. Timers are scheduled against a [`Clock`] rather than calling [`Instant::now`]
//! directly, so the registry can be ticked against a simulated timeline.
//!
//! - [`MonotonicClock`] reads the OS monotonic clock and is the runtime default.
//! - [`ManualClock`] only moves when told to, which makes timer ordering tests
//!   deterministic.
//!
//! # Example
//!
//! ```ignore
//! use hostloop::{Clock, ManualClock};
//! use std::time::Duration;
//!
//! let clock = ManualClock::new();
//! let start = clock.now();
//! clock.advance(Duration::from_millis(5));
//! assert_eq!(clock.now() - start, Duration::from_millis(5));
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Source of monotonic instants for timer expiry computations.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only advances when explicitly moved forward.
///
/// Clones share the same underlying instant, so a test can keep one clone and
/// hand another to the registry.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Creates a manual clock frozen at the current monotonic instant.
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Creates a manual clock frozen at `start`.
    pub fn starting_at(start: Instant) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    /// Moves the clock to `to`. Instants earlier than the current one are ignored.
    pub fn set(&self, to: Instant) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if to > *now {
            *now = to;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_forward() {
        let clock = ManualClock::new();
        let start = clock.now();

        clock.advance(Duration::from_millis(10));
        assert_eq!(clock.now() - start, Duration::from_millis(10));

        clock.set(start);
        assert_eq!(clock.now() - start, Duration::from_millis(10));

        clock.set(start + Duration::from_millis(25));
        assert_eq!(clock.now() - start, Duration::from_millis(25));
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let shared = clock.clone();

        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.now(), shared.now());
    }
}
