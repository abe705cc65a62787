//! Software timers fired on the loop thread.
//!
//! The [`TimerRegistry`] owns every scheduled timer, keyed by `(expiry, handle)`.
//! Each call to [`TimerRegistry::tick`] takes a snapshot of the due entries and
//! fires them in that key order, so timers sharing an expiry fire in
//! registration order. Timers registered or rearmed while a tick is running are
//! never fired by that same tick.
//!
//! Entry lifecycle:
//!
//! ```text
//! Registered --due--> Firing --repeating, not cancelled--> Registered (rearmed)
//!     |                  |
//!     +--cancel--> Removed <--one-shot or cancelled while firing
//! ```
//!
//! A repeating timer that cancels itself from inside its own callback finishes
//! that invocation and is then dropped instead of rearmed.
//!
//! # Example
//!
//! ```ignore
//! use hostloop::{ManualClock, TimerMode, TimerRegistry};
//! use std::{sync::Arc, time::Duration};
//!
//! let clock = ManualClock::new();
//! let mut timers = TimerRegistry::new(Arc::new(clock.clone()));
//! let handle = timers.register(Duration::from_millis(5), TimerMode::OneShot, Vec::new(), |_, _| {
//!     println!("fired");
//!     Ok(())
//! });
//! clock.advance(Duration::from_millis(5));
//! ```

use crate::error::RuntimeError;
use crate::runtime::{LoopContext, Spawner};
use crate::time::{Clock, MonotonicClock};

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

/// Smallest period a repeating timer may have.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Largest delay or period accepted; longer values are clamped to it.
pub const MAX_DELAY: Duration = Duration::from_millis(i32::MAX as u64);

/// An argument captured at registration and passed to every firing.
pub type TimerArg = Box<dyn Any>;

/// Arguments captured by a timer.
pub type TimerArgs = Vec<TimerArg>;

type TimerCallback = Box<dyn FnMut(&mut LoopContext<'_>, &[TimerArg]) -> anyhow::Result<()>>;

/// Identifier of a registered timer.
///
/// Handles increase monotonically and are never reused by a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Rebuilds a handle from its numeric form, e.g. a number passed back from a script.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Numeric form of the handle.
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a timer fires once or keeps rearming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    Repeating { period: Duration },
}

impl TimerMode {
    fn clamped(self) -> Self {
        match self {
            Self::OneShot => Self::OneShot,
            Self::Repeating { period } => Self::Repeating {
                period: period.clamp(MIN_PERIOD, MAX_DELAY),
            },
        }
    }
}

struct TimerEntry {
    handle: TimerHandle,
    expiry: Instant,
    mode: TimerMode,
    callback: TimerCallback,
    args: TimerArgs,
}

/// Marks an entry whose callback is running, valid only during that call.
struct Firing {
    handle: TimerHandle,
    cancelled: bool,
}

/// Owner of all scheduled timers. Loop-thread only.
pub struct TimerRegistry {
    clock: Arc<dyn Clock>,
    live: BTreeMap<(Instant, TimerHandle), TimerEntry>,
    expiries: HashMap<TimerHandle, Instant>,
    next_handle: u64,
    // One marker per callback on the stack; a callback may tick re-entrantly.
    firing: Vec<Firing>,
}

impl TimerRegistry {
    /// Creates an empty registry reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            live: BTreeMap::new(),
            expiries: HashMap::new(),
            next_handle: 1,
            firing: Vec::new(),
        }
    }

    /// Current time according to the registry's clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Schedules `callback` to run with `args` after `delay`.
    ///
    /// Repeating periods are raised to at least [`MIN_PERIOD`]. Delays and periods
    /// above [`MAX_DELAY`] are clamped to it.
    ///
    /// # Arguments
    /// * `delay` - Time until the first firing
    /// * `mode` - One-shot or repeating with a period
    /// * `args` - Values passed to every invocation
    /// * `callback` - Runs on the loop thread each time the timer fires
    ///
    /// # Returns
    /// A handle that was never issued before by this registry
    pub fn register<F>(
        &mut self,
        delay: Duration,
        mode: TimerMode,
        args: TimerArgs,
        callback: F,
    ) -> TimerHandle
    where
        F: FnMut(&mut LoopContext<'_>, &[TimerArg]) -> anyhow::Result<()> + 'static,
    {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;

        let expiry = self.clock.now() + delay.min(MAX_DELAY);
        let mode = mode.clamped();
        trace!(%handle, ?delay, ?mode, "timer registered");

        self.insert(TimerEntry {
            handle,
            expiry,
            mode,
            callback: Box::new(callback),
            args,
        });
        handle
    }

    /// Cancels a timer.
    ///
    /// A timer cancelled from inside its own callback finishes that invocation
    /// and is not rearmed. Unknown, fired or already cancelled handles are
    /// ignored.
    pub fn cancel(&mut self, handle: TimerHandle) {
        for firing in self.firing.iter_mut().filter(|firing| firing.handle == handle) {
            firing.cancelled = true;
        }

        if let Some(expiry) = self.expiries.remove(&handle) {
            self.live.remove(&(expiry, handle));
            trace!(%handle, "timer cancelled");
        }
    }

    /// Fires every timer whose expiry is at or before `now`.
    ///
    /// Due timers run in `(expiry, handle)` order. A repeating timer is rearmed
    /// one period after its callback returns, measured on the registry's clock.
    /// The first callback error stops the tick; later due timers stay scheduled
    /// and the error is returned.
    ///
    /// # Returns
    /// Whether any timers remain scheduled, or the first callback error
    pub fn tick(&mut self, now: Instant, spawner: &Spawner) -> Result<bool, RuntimeError> {
        let due: Vec<_> = self
            .live
            .range(..=(now, TimerHandle(u64::MAX)))
            .map(|(key, _)| *key)
            .collect();

        for key in due {
            // An earlier callback in this tick may have cancelled it.
            let Some(mut entry) = self.live.remove(&key) else {
                continue;
            };
            self.expiries.remove(&entry.handle);

            let handle = entry.handle;
            trace!(%handle, "timer firing");

            self.firing.push(Firing {
                handle,
                cancelled: false,
            });
            let result = {
                let mut cx = LoopContext::new(self, spawner);
                (entry.callback)(&mut cx, &entry.args)
            };
            let cancelled = self.firing.pop().is_some_and(|firing| firing.cancelled);

            if let Err(err) = result {
                return Err(RuntimeError::Timer {
                    handle,
                    source: err.into(),
                });
            }

            if let TimerMode::Repeating { period } = entry.mode
                && !cancelled
            {
                entry.expiry = self.clock.now() + period;
                trace!(%handle, ?period, "timer rearmed");
                self.insert(entry);
            }
        }

        Ok(!self.live.is_empty())
    }

    /// Time until the earliest expiry, or `None` when nothing is scheduled.
    ///
    /// Overdue timers report [`Duration::ZERO`].
    pub fn next_delay(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.live
            .keys()
            .next()
            .map(|(expiry, _)| expiry.saturating_duration_since(now))
    }

    /// Returns true if `handle` is scheduled.
    pub fn contains(&self, handle: TimerHandle) -> bool {
        self.expiries.contains_key(&handle)
    }

    /// Number of scheduled timers.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Returns true if no timers are scheduled.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn insert(&mut self, entry: TimerEntry) {
        self.expiries.insert(entry.handle, entry.expiry);
        self.live.insert((entry.expiry, entry.handle), entry);
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new(Arc::new(MonotonicClock))
    }
}

impl fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("live", &self.live.len())
            .field("next_handle", &self.next_handle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CompletionQueue, WorkerPool};
    use crate::time::ManualClock;

    use std::cell::RefCell;
    use std::rc::Rc;

    const MS: Duration = Duration::from_millis(1);

    fn setup() -> (ManualClock, TimerRegistry, Spawner) {
        let clock = ManualClock::new();
        let timers = TimerRegistry::new(Arc::new(clock.clone()));
        let pool = WorkerPool::new(1, "timer-test").unwrap();
        let spawner = Spawner::new(Arc::new(pool), Arc::new(CompletionQueue::new()));
        (clock, timers, spawner)
    }

    type Log = Rc<RefCell<Vec<u64>>>;

    fn recorder(
        log: &Log,
        tag: u64,
    ) -> impl FnMut(&mut LoopContext<'_>, &[TimerArg]) -> anyhow::Result<()> + 'static {
        let log = log.clone();
        move |_, _| {
            log.borrow_mut().push(tag);
            Ok(())
        }
    }

    #[test]
    fn fires_only_when_due() {
        let (clock, mut timers, spawner) = setup();
        let log = Log::default();

        timers.register(10 * MS, TimerMode::OneShot, Vec::new(), recorder(&log, 1));

        clock.advance(9 * MS);
        assert!(timers.tick(clock.now(), &spawner).unwrap());
        assert!(log.borrow().is_empty());

        clock.advance(MS);
        assert!(!timers.tick(clock.now(), &spawner).unwrap());
        assert_eq!(*log.borrow(), vec![1]);
        assert!(timers.is_empty());
    }

    #[test]
    fn equal_expiries_fire_in_registration_order() {
        let (clock, mut timers, spawner) = setup();
        let log = Log::default();

        let a = timers.register(5 * MS, TimerMode::OneShot, Vec::new(), recorder(&log, 1));
        let b = timers.register(5 * MS, TimerMode::OneShot, Vec::new(), recorder(&log, 2));
        assert!(a < b);

        clock.advance(5 * MS);
        timers.tick(clock.now(), &spawner).unwrap();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn earlier_expiry_fires_first_regardless_of_handle() {
        let (clock, mut timers, spawner) = setup();
        let log = Log::default();

        timers.register(8 * MS, TimerMode::OneShot, Vec::new(), recorder(&log, 1));
        timers.register(3 * MS, TimerMode::OneShot, Vec::new(), recorder(&log, 2));

        clock.advance(10 * MS);
        timers.tick(clock.now(), &spawner).unwrap();
        assert_eq!(*log.borrow(), vec![2, 1]);
    }

    #[test]
    fn cancelled_before_expiry_never_fires() {
        let (clock, mut timers, spawner) = setup();
        let log = Log::default();

        let handle = timers.register(5 * MS, TimerMode::OneShot, Vec::new(), recorder(&log, 1));
        assert!(timers.contains(handle));
        timers.cancel(handle);
        assert!(!timers.contains(handle));

        clock.advance(10 * MS);
        assert!(!timers.tick(clock.now(), &spawner).unwrap());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn cancel_unknown_handle_is_noop() {
        let (_clock, mut timers, _spawner) = setup();
        timers.cancel(TimerHandle::from_raw(42));
        assert!(timers.is_empty());
    }

    #[test]
    fn handles_are_never_reused() {
        let (clock, mut timers, spawner) = setup();
        let first = timers.register(Duration::ZERO, TimerMode::OneShot, Vec::new(), |_, _| Ok(()));
        timers.tick(clock.now(), &spawner).unwrap();
        let second = timers.register(Duration::ZERO, TimerMode::OneShot, Vec::new(), |_, _| Ok(()));
        assert!(second > first);
    }

    #[test]
    fn repeating_timer_rearms_after_callback() {
        let (clock, mut timers, spawner) = setup();
        let fired_at: Rc<RefCell<Vec<Instant>>> = Rc::default();
        let start = clock.now();

        let fired = fired_at.clone();
        timers.register(
            5 * MS,
            TimerMode::Repeating { period: 10 * MS },
            Vec::new(),
            move |cx, _| {
                fired.borrow_mut().push(cx.now());
                Ok(())
            },
        );

        for _ in 0..35 {
            clock.advance(MS);
            timers.tick(clock.now(), &spawner).unwrap();
        }

        let offsets: Vec<_> = fired_at.borrow().iter().map(|t| *t - start).collect();
        assert_eq!(offsets, vec![5 * MS, 15 * MS, 25 * MS, 35 * MS]);
    }

    #[test]
    fn rearm_uses_time_after_callback() {
        let (clock, mut timers, spawner) = setup();
        let callback_clock = clock.clone();

        timers.register(
            Duration::ZERO,
            TimerMode::Repeating { period: 10 * MS },
            Vec::new(),
            move |_, _| {
                // Callback takes 4ms of simulated time.
                callback_clock.advance(4 * MS);
                Ok(())
            },
        );

        let now = clock.now();
        timers.tick(now, &spawner).unwrap();
        assert_eq!(timers.next_delay(), Some(10 * MS));
    }

    #[test]
    fn self_cancel_fires_once() {
        let (clock, mut timers, spawner) = setup();
        let count = Rc::new(RefCell::new(0));
        let slot: Rc<RefCell<Option<TimerHandle>>> = Rc::default();

        let (counter, own) = (count.clone(), slot.clone());
        let handle = timers.register(
            MS,
            TimerMode::Repeating { period: MS },
            Vec::new(),
            move |cx, _| {
                *counter.borrow_mut() += 1;
                if let Some(handle) = *own.borrow() {
                    cx.clear_interval(handle);
                }
                Ok(())
            },
        );
        *slot.borrow_mut() = Some(handle);

        for _ in 0..10 {
            clock.advance(MS);
            timers.tick(clock.now(), &spawner).unwrap();
        }

        assert_eq!(*count.borrow(), 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn self_cancel_survives_nested_tick() {
        let (clock, mut timers, spawner) = setup();
        let count = Rc::new(RefCell::new(0));
        let slot: Rc<RefCell<Option<TimerHandle>>> = Rc::default();
        let log = Log::default();

        let (counter, own) = (count.clone(), slot.clone());
        let handle = timers.register(
            MS,
            TimerMode::Repeating { period: MS },
            Vec::new(),
            move |cx, _| {
                *counter.borrow_mut() += 1;
                if let Some(handle) = *own.borrow() {
                    cx.clear_interval(handle);
                }
                let spawner = cx.spawner().clone();
                let now = cx.now();
                cx.timers().tick(now, &spawner)?;
                Ok(())
            },
        );
        *slot.borrow_mut() = Some(handle);
        timers.register(MS, TimerMode::OneShot, Vec::new(), recorder(&log, 2));

        for _ in 0..5 {
            clock.advance(MS);
            timers.tick(clock.now(), &spawner).unwrap();
        }

        assert_eq!(*count.borrow(), 1);
        assert_eq!(*log.borrow(), vec![2]);
        assert!(timers.is_empty());
    }

    #[test]
    fn callback_can_cancel_a_later_due_timer() {
        let (clock, mut timers, spawner) = setup();
        let log = Log::default();
        let victim: Rc<RefCell<Option<TimerHandle>>> = Rc::default();

        let (first_log, target) = (log.clone(), victim.clone());
        timers.register(MS, TimerMode::OneShot, Vec::new(), move |cx, _| {
            first_log.borrow_mut().push(1);
            if let Some(handle) = *target.borrow() {
                cx.clear_timeout(handle);
            }
            Ok(())
        });
        let second = timers.register(MS, TimerMode::OneShot, Vec::new(), recorder(&log, 2));
        *victim.borrow_mut() = Some(second);

        clock.advance(MS);
        assert!(!timers.tick(clock.now(), &spawner).unwrap());
        assert_eq!(*log.borrow(), vec![1]);
    }

    #[test]
    fn timers_registered_during_tick_wait_for_next_tick() {
        let (clock, mut timers, spawner) = setup();
        let log = Log::default();

        let inner_log = log.clone();
        timers.register(Duration::ZERO, TimerMode::OneShot, Vec::new(), move |cx, _| {
            inner_log.borrow_mut().push(1);
            let nested_log = inner_log.clone();
            cx.set_timeout(Duration::ZERO, Vec::new(), move |_, _| {
                nested_log.borrow_mut().push(2);
                Ok(())
            });
            Ok(())
        });

        assert!(timers.tick(clock.now(), &spawner).unwrap());
        assert_eq!(*log.borrow(), vec![1]);

        assert!(!timers.tick(clock.now(), &spawner).unwrap());
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn callback_error_aborts_tick() {
        let (clock, mut timers, spawner) = setup();
        let log = Log::default();

        let failing = timers.register(MS, TimerMode::OneShot, Vec::new(), |_, _| {
            Err(anyhow::anyhow!("boom"))
        });
        timers.register(MS, TimerMode::OneShot, Vec::new(), recorder(&log, 2));

        clock.advance(MS);
        let err = timers.tick(clock.now(), &spawner).unwrap_err();
        match err {
            RuntimeError::Timer { handle, source } => {
                assert_eq!(handle, failing);
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(log.borrow().is_empty());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn captured_args_reach_callback() {
        let (clock, mut timers, spawner) = setup();
        let seen: Rc<RefCell<Vec<String>>> = Rc::default();

        let sink = seen.clone();
        timers.register(
            Duration::ZERO,
            TimerMode::OneShot,
            vec![Box::new(7i32) as TimerArg, Box::new("seven") as TimerArg],
            move |_, args| {
                let number = args[0].downcast_ref::<i32>().copied().unwrap_or_default();
                let word = args[1].downcast_ref::<&str>().copied().unwrap_or_default();
                sink.borrow_mut().push(format!("{number}:{word}"));
                Ok(())
            },
        );

        timers.tick(clock.now(), &spawner).unwrap();
        assert_eq!(*seen.borrow(), vec!["7:seven".to_string()]);
    }

    #[test]
    fn zero_period_is_raised_to_minimum() {
        let (clock, mut timers, spawner) = setup();
        let log = Log::default();

        timers.register(
            Duration::ZERO,
            TimerMode::Repeating { period: Duration::ZERO },
            Vec::new(),
            recorder(&log, 1),
        );

        timers.tick(clock.now(), &spawner).unwrap();
        timers.tick(clock.now(), &spawner).unwrap();
        assert_eq!(*log.borrow(), vec![1]);
        assert_eq!(timers.next_delay(), Some(MIN_PERIOD));
    }

    #[test]
    fn next_delay_tracks_earliest_expiry() {
        let (clock, mut timers, _spawner) = setup();
        assert_eq!(timers.next_delay(), None);

        timers.register(30 * MS, TimerMode::OneShot, Vec::new(), |_, _| Ok(()));
        timers.register(12 * MS, TimerMode::OneShot, Vec::new(), |_, _| Ok(()));
        assert_eq!(timers.next_delay(), Some(12 * MS));

        clock.advance(20 * MS);
        assert_eq!(timers.next_delay(), Some(Duration::ZERO));
    }

    #[test]
    fn huge_delays_are_clamped() {
        let (_clock, mut timers, _spawner) = setup();
        timers.register(Duration::MAX, TimerMode::OneShot, Vec::new(), |_, _| Ok(()));
        assert_eq!(timers.next_delay(), Some(MAX_DELAY));
    }

    #[test]
    fn interleaved_register_cancel_tick_never_fires_early() {
        // Small deterministic pseudo-random schedule over a simulated clock.
        let (clock, mut timers, spawner) = setup();
        let start = clock.now();
        let violations = Rc::new(RefCell::new(0usize));
        let fired: Rc<RefCell<Vec<TimerHandle>>> = Rc::default();
        let mut cancelled = Vec::new();
        let mut seed = 0x2545_f491_u64;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for step in 0..400u64 {
            match next() % 4 {
                0 | 1 => {
                    let delay = MS * (next() % 20) as u32;
                    let expiry = clock.now() + delay;
                    let (violations, fired) = (violations.clone(), fired.clone());
                    let handle_slot: Rc<RefCell<Option<TimerHandle>>> = Rc::default();
                    let slot = handle_slot.clone();
                    let handle = timers.register(delay, TimerMode::OneShot, Vec::new(), move |cx, _| {
                        if cx.now() < expiry {
                            *violations.borrow_mut() += 1;
                        }
                        if let Some(handle) = *slot.borrow() {
                            fired.borrow_mut().push(handle);
                        }
                        Ok(())
                    });
                    *handle_slot.borrow_mut() = Some(handle);
                }
                2 => {
                    let raw = 1 + next() % (step + 1);
                    let handle = TimerHandle::from_raw(raw);
                    if timers.contains(handle) {
                        cancelled.push(handle);
                    }
                    timers.cancel(handle);
                }
                _ => {
                    clock.advance(MS * (next() % 5) as u32);
                    timers.tick(clock.now(), &spawner).unwrap();
                }
            }
        }
        clock.set(start + Duration::from_secs(10));
        timers.tick(clock.now(), &spawner).unwrap();

        assert_eq!(*violations.borrow(), 0);
        assert!(timers.is_empty());
        for handle in cancelled {
            assert!(!fired.borrow().contains(&handle), "cancelled timer {handle} fired");
        }
    }
}
