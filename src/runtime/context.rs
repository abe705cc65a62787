//! Loop-thread execution context handed to continuations and timer callbacks.
//!
//! Continuations and timer callbacks run with a [`LoopContext`], which lends
//! them the timer registry and a [`Spawner`] for the duration of the call. No
//! lock is held while they run, so they may register or cancel timers and submit
//! more work freely.
//!
//! [`Spawner`] is the cross-thread half: it is `Clone + Send` and can be moved
//! into work units so they can chain further work or post completions.
//!
//! # Example
//!
//! ```ignore
//! let mut rt = Runtime::builder().build()?;
//! let mut cx = rt.context();
//! cx.set_timeout(Duration::from_millis(10), Vec::new(), |cx, _| {
//!     cx.spawn_blocking(|| Ok(2 + 2), |_, sum| {
//!         println!("sum = {}", sum?);
//!         Ok(())
//!     });
//!     Ok(())
//! });
//! rt.run()?;
//! ```

use crate::error::WorkError;
use crate::runtime::completion::Completer;
use crate::runtime::pool::{WorkerPool, panic_message};
use crate::runtime::queue::CompletionQueue;
use crate::timer::{MIN_PERIOD, TimerArg, TimerArgs, TimerHandle, TimerMode, TimerRegistry};

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cloneable handle for submitting blocking work from any thread.
#[derive(Clone)]
pub struct Spawner {
    pool: Arc<WorkerPool>,
    completions: Arc<CompletionQueue>,
}

impl Spawner {
    pub(crate) fn new(pool: Arc<WorkerPool>, completions: Arc<CompletionQueue>) -> Self {
        Self { pool, completions }
    }

    /// Submits a raw unit of work to the pool.
    ///
    /// The unit is responsible for posting its own completion, typically through
    /// a [`Completer`] moved into it. A panic escaping the unit is logged by the
    /// worker and nothing is delivered.
    ///
    /// # Panics
    /// Panics if the runtime owning the pool has been dropped.
    pub fn submit<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.submit(Box::new(work));
    }

    /// Runs `work` on a worker thread and delivers its outcome to
    /// `continuation` on the loop thread.
    ///
    /// Errors and panics inside `work` are caught on the worker and delivered as
    /// a [`WorkError`].
    pub fn spawn_blocking<T, W, C>(&self, work: W, continuation: C)
    where
        T: Send + 'static,
        W: FnOnce() -> anyhow::Result<T> + Send + 'static,
        C: FnOnce(&mut LoopContext<'_>, Result<T, WorkError>) -> anyhow::Result<()>
            + Send
            + 'static,
    {
        let completer = self.completer();
        self.submit(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(WorkError::Failed(err.into())),
                Err(panic) => Err(WorkError::Panicked(panic_message(panic.as_ref()))),
            };
            completer.complete(outcome, continuation);
        });
    }

    /// Returns a token that posts one completion to the loop thread.
    pub fn completer(&self) -> Completer {
        Completer::new(self.completions.clone())
    }

    /// Returns true while submitted work is queued or running.
    pub fn has_pending_work(&self) -> bool {
        self.pool.has_pending_work()
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub(crate) fn completions(&self) -> &CompletionQueue {
        &self.completions
    }
}

impl fmt::Debug for Spawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spawner")
            .field("threads", &self.pool.thread_count())
            .finish_non_exhaustive()
    }
}

/// Execution context available on the loop thread.
pub struct LoopContext<'a> {
    timers: &'a mut TimerRegistry,
    spawner: &'a Spawner,
}

impl<'a> LoopContext<'a> {
    pub(crate) fn new(timers: &'a mut TimerRegistry, spawner: &'a Spawner) -> Self {
        Self { timers, spawner }
    }

    /// The timer registry.
    pub fn timers(&mut self) -> &mut TimerRegistry {
        &mut *self.timers
    }

    /// The spawner, clonable into work units.
    pub fn spawner(&self) -> &Spawner {
        self.spawner
    }

    /// Current time according to the registry's clock.
    pub fn now(&self) -> Instant {
        self.timers.now()
    }

    /// Schedules `callback` once after `delay`.
    pub fn set_timeout<F>(&mut self, delay: Duration, args: TimerArgs, callback: F) -> TimerHandle
    where
        F: FnMut(&mut LoopContext<'_>, &[TimerArg]) -> anyhow::Result<()> + 'static,
    {
        self.timers.register(delay, TimerMode::OneShot, args, callback)
    }

    /// Schedules `callback` every `period`, starting one period from now.
    ///
    /// Periods shorter than [`MIN_PERIOD`] are raised to it.
    pub fn set_interval<F>(
        &mut self,
        period: Duration,
        args: TimerArgs,
        callback: F,
    ) -> TimerHandle
    where
        F: FnMut(&mut LoopContext<'_>, &[TimerArg]) -> anyhow::Result<()> + 'static,
    {
        let period = period.max(MIN_PERIOD);
        self.timers
            .register(period, TimerMode::Repeating { period }, args, callback)
    }

    /// Cancels a timeout. Unknown handles are ignored.
    pub fn clear_timeout(&mut self, handle: TimerHandle) {
        self.timers.cancel(handle);
    }

    /// Cancels an interval. Same operation as [`LoopContext::clear_timeout`].
    pub fn clear_interval(&mut self, handle: TimerHandle) {
        self.timers.cancel(handle);
    }

    /// See [`Spawner::submit`].
    pub fn submit<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawner.submit(work);
    }

    /// See [`Spawner::spawn_blocking`].
    pub fn spawn_blocking<T, W, C>(&self, work: W, continuation: C)
    where
        T: Send + 'static,
        W: FnOnce() -> anyhow::Result<T> + Send + 'static,
        C: FnOnce(&mut LoopContext<'_>, Result<T, WorkError>) -> anyhow::Result<()>
            + Send
            + 'static,
    {
        self.spawner.spawn_blocking(work, continuation);
    }
}
