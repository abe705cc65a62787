//! Fluent builder for Runtime construction.
//!
//! Provides a builder pattern interface for configuring the worker pool, the
//! idle polling ceiling, the timer clock and the checkpoint hook.

use crate::error::BuildError;
use crate::runtime::{CheckpointHook, CompletionQueue, LoopContext, Runtime, Spawner, WorkerPool};
use crate::time::{Clock, MonotonicClock};
use crate::timer::TimerRegistry;

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Default upper bound on a single idle wait of the loop thread.
pub const DEFAULT_POLLING_CEILING: Duration = Duration::from_millis(50);

const DEFAULT_THREAD_NAME: &str = "hostloop-worker";

/// Builder for constructing Runtime instances with fluent API.
///
/// # Example
/// ```ignore
/// let rt = RuntimeBuilder::new()
///     .worker_threads(4)
///     .polling_ceiling(Duration::from_millis(20))
///     .build()?;
/// ```
pub struct RuntimeBuilder {
    worker_threads: usize,
    polling_ceiling: Duration,
    clock: Arc<dyn Clock>,
    thread_name: String,
    checkpoint: Option<CheckpointHook>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// Creates a builder with one worker per available CPU and a 50ms polling ceiling.
    pub fn new() -> Self {
        Self {
            worker_threads: thread::available_parallelism().map_or(1, |n| n.get()),
            polling_ceiling: DEFAULT_POLLING_CEILING,
            clock: Arc::new(MonotonicClock),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            checkpoint: None,
        }
    }

    /// Sets the number of worker threads. Zero is treated as one.
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }

    /// Sets the longest the loop blocks between liveness checks when idle.
    ///
    /// Timers fire at most this late relative to their expiry when nothing else
    /// wakes the loop. Zero is treated as one millisecond.
    pub fn polling_ceiling(mut self, ceiling: Duration) -> Self {
        self.polling_ceiling = ceiling.max(Duration::from_millis(1));
        self
    }

    /// Sets the clock the timer registry schedules against.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the prefix used to name worker threads.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Installs a hook run on the loop thread after every delivered completion,
    /// after every timer tick, and once before the loop decides it is finished.
    ///
    /// Hosts embedding a script engine use it to flush the engine's own job
    /// queue. An error from the hook ends [`Runtime::run`].
    pub fn on_checkpoint<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut LoopContext<'_>) -> anyhow::Result<()> + 'static,
    {
        self.checkpoint = Some(Box::new(hook));
        self
    }

    /// Spawns the worker pool and returns the configured runtime.
    ///
    /// # Returns
    /// The runtime, or [`BuildError`] if a worker thread could not be spawned
    pub fn build(self) -> Result<Runtime, BuildError> {
        let completions = Arc::new(CompletionQueue::new());
        let idle_queue = completions.clone();
        // Lets a loop blocked on the queue notice that the pool has gone idle.
        let pool = WorkerPool::with_idle_hook(self.worker_threads, &self.thread_name, move || {
            idle_queue.wake()
        })?;
        let spawner = Spawner::new(Arc::new(pool), completions);

        Ok(Runtime::from_parts(
            TimerRegistry::new(self.clock),
            spawner,
            self.polling_ceiling,
            self.checkpoint,
        ))
    }
}

impl fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("worker_threads", &self.worker_threads)
            .field("polling_ceiling", &self.polling_ceiling)
            .field("thread_name", &self.thread_name)
            .field("checkpoint", &self.checkpoint.is_some())
            .finish_non_exhaustive()
    }
}
