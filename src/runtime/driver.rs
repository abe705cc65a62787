//! The event loop driver.
//!
//! Provides [`Runtime`], which owns the timers, the completion queue and the
//! worker pool. [`Runtime::run`] is the single blocking entry point. Each iteration it:
//!
//! 1. delivers every queued completion on the loop thread,
//! 2. ticks the timer registry if any timers are scheduled,
//! 3. stops once no timers, completions or pool work remain (checked twice, with
//!    a drain in between, so a worker posting right before the check is not lost),
//! 4. otherwise blocks on the completion queue until the next timer is due,
//!    bounded by the polling ceiling.
//!
//! The first failing continuation, timer callback or checkpoint hook ends the run
//! with a [`RuntimeError`]; nothing further is processed.

use crate::builder::RuntimeBuilder;
use crate::error::RuntimeError;
use crate::runtime::context::{LoopContext, Spawner};
use crate::runtime::stop::StopHandle;
use crate::timer::TimerRegistry;

use std::fmt;
use std::time::Duration;

use tracing::debug;

/// Loop-thread hook run after each delivery and each timer tick.
pub type CheckpointHook = Box<dyn FnMut(&mut LoopContext<'_>) -> anyhow::Result<()>>;

/// Why [`Runtime::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// No timers, completions or pending work were left.
    Idle,
    /// A stop was requested through a [`StopHandle`].
    Stopped,
}

/// Event loop owning the timers, the completion queue and the worker pool.
///
/// Lives on the loop thread. Dropping it shuts the worker pool down, waiting for
/// running units to finish; completions they post afterwards are discarded.
pub struct Runtime {
    timers: TimerRegistry,
    spawner: Spawner,
    polling_ceiling: Duration,
    stop: StopHandle,
    checkpoint: Option<CheckpointHook>,
}

impl Runtime {
    /// Returns a builder for configuring a runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub(crate) fn from_parts(
        timers: TimerRegistry,
        spawner: Spawner,
        polling_ceiling: Duration,
        checkpoint: Option<CheckpointHook>,
    ) -> Self {
        Self {
            timers,
            spawner,
            polling_ceiling,
            stop: StopHandle::new(),
            checkpoint,
        }
    }

    /// Borrows a loop-thread context, e.g. to schedule initial timers before [`Runtime::run`].
    pub fn context(&mut self) -> LoopContext<'_> {
        LoopContext::new(&mut self.timers, &self.spawner)
    }

    /// Returns a spawner for submitting work from any thread.
    pub fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }

    /// Returns a handle that can stop [`Runtime::run`] from any thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// The timer registry.
    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    /// Polling ceiling used to bound idle waits.
    pub fn polling_ceiling(&self) -> Duration {
        self.polling_ceiling
    }

    /// Runs the loop until no work remains, a stop is requested, or a callback fails.
    ///
    /// While units are still running and nothing is queued, the loop blocks on
    /// the completion queue; it wakes when a completion arrives, when the pool
    /// goes idle, when the next timer is due, or after the polling ceiling.
    ///
    /// # Returns
    /// Why the loop ended, or the first error raised by a continuation, timer
    /// callback or checkpoint hook
    pub fn run(&mut self) -> Result<Exit, RuntimeError> {
        debug!("event loop started");

        loop {
            self.drain()?;

            if self.stop.is_stopped() {
                return Ok(self.stopped());
            }

            if !self.timers.is_empty() {
                let now = self.timers.now();
                self.timers.tick(now, &self.spawner)?;
                self.run_checkpoint()?;
            }

            let epoch = self.spawner.completions().epoch();
            if self.is_idle() {
                self.run_checkpoint()?;
                self.drain()?;

                if self.is_idle() {
                    debug!("event loop finished: no work left");
                    return Ok(Exit::Idle);
                }
            }

            if self.spawner.completions().is_empty() {
                let timeout = self
                    .timers
                    .next_delay()
                    .map_or(self.polling_ceiling, |delay| delay.min(self.polling_ceiling));
                self.spawner.completions().wait_since(epoch, timeout);
            }
        }
    }

    fn drain(&mut self) -> Result<(), RuntimeError> {
        while !self.stop.is_stopped() {
            let Some(record) = self.spawner.completions().dequeue() else {
                break;
            };

            let mut cx = LoopContext::new(&mut self.timers, &self.spawner);
            record
                .deliver(&mut cx)
                .map_err(|err| RuntimeError::Completion { source: err.into() })?;

            self.run_checkpoint()?;
        }
        Ok(())
    }

    fn run_checkpoint(&mut self) -> Result<(), RuntimeError> {
        let Some(hook) = self.checkpoint.as_mut() else {
            return Ok(());
        };

        let mut cx = LoopContext::new(&mut self.timers, &self.spawner);
        hook(&mut cx).map_err(|err| RuntimeError::Checkpoint { source: err.into() })
    }

    fn is_idle(&self) -> bool {
        // Pool first: a unit posts its completion before it stops counting as
        // pending, so an idle pool means the queue already holds its record.
        !self.spawner.has_pending_work()
            && self.spawner.completions().is_empty()
            && self.timers.is_empty()
    }

    fn stopped(&mut self) -> Exit {
        let discarded = self.spawner.completions().discard();
        debug!(discarded, "event loop stopped on request");
        Exit::Stopped
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.spawner.pool().shutdown();

        let discarded = self.spawner.completions().discard();
        if discarded > 0 {
            debug!(discarded, "dropped undelivered completions");
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("timers", &self.timers)
            .field("spawner", &self.spawner)
            .field("polling_ceiling", &self.polling_ceiling)
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}
