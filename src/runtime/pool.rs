//! Fixed-size pool of worker threads executing blocking work.
//!
//! Provides the background threads that run [`WorkUnit`]s off the loop thread.
//! Workers wait on a shared FIFO of [`WorkUnit`]s. Each worker pops one unit,
//! marks it active, runs it with the lock released and then clears the mark.
//! The queue and the active count live under the same mutex, which is what makes
//! [`WorkerPool::has_pending_work`] free of false negatives: a unit is either
//! still queued or counted as active until it has finished running.
//!
//! An optional idle hook runs on the worker that takes the pool from busy to
//! idle, after the active count has dropped.

use crate::error::BuildError;
use crate::runtime::completion::WorkUnit;

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

struct PoolState {
    queue: VecDeque<WorkUnit>,
    active: usize,
    stop: bool,
}

type IdleHook = Box<dyn Fn() + Send + Sync>;

struct Shared {
    state: Mutex<PoolState>,
    available: Condvar,
    on_idle: Option<IdleHook>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fixed set of background threads draining a queue of blocking work.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
}

impl WorkerPool {
    /// Spawns `thread_count` workers (at least one) named `{name}-{index}`.
    ///
    /// If a thread fails to spawn, the ones already running are shut down before
    /// the error is returned.
    ///
    /// # Arguments
    /// * `thread_count` - Number of workers, zero is treated as one
    /// * `name` - Prefix for the worker thread names
    pub fn new(thread_count: usize, name: &str) -> Result<Self, BuildError> {
        Self::spawn(thread_count, name, None)
    }

    /// Same as [`WorkerPool::new`], calling `on_idle` each time the last
    /// running unit returns with nothing left queued.
    pub(crate) fn with_idle_hook<F>(
        thread_count: usize,
        name: &str,
        on_idle: F,
    ) -> Result<Self, BuildError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::spawn(thread_count, name, Some(Box::new(on_idle)))
    }

    fn spawn(thread_count: usize, name: &str, on_idle: Option<IdleHook>) -> Result<Self, BuildError> {
        let thread_count = thread_count.max(1);
        let pool = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    active: 0,
                    stop: false,
                }),
                available: Condvar::new(),
                on_idle,
            }),
            workers: Mutex::new(Vec::with_capacity(thread_count)),
            thread_count,
        };

        for index in 0..thread_count {
            let shared = pool.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(index, &shared))
                .map_err(|source| BuildError::SpawnWorker { index, source })?;

            pool.workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }

        debug!(threads = thread_count, "worker pool started");
        Ok(pool)
    }

    /// Queues a unit of work and wakes one idle worker.
    ///
    /// # Arguments
    /// * `work` - The unit to run on a worker thread
    ///
    /// # Panics
    /// Panics if the pool has already been shut down. Work is never dropped
    /// silently.
    pub fn submit(&self, work: WorkUnit) {
        {
            let mut state = self.shared.lock();
            if state.stop {
                drop(state);
                panic!("WorkerPool::submit called after shutdown");
            }
            state.queue.push_back(work);
            trace!(queued = state.queue.len(), "work submitted");
        }
        self.shared.available.notify_one();
    }

    /// Checks whether any submitted unit is queued or still executing.
    ///
    /// # Returns
    /// true until every submitted unit has returned, false otherwise
    pub fn has_pending_work(&self) -> bool {
        let state = self.shared.lock();
        !state.queue.is_empty() || state.active > 0
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Stops the pool and joins every worker.
    ///
    /// Units already queued still run before the workers exit. Calling this more
    /// than once is harmless.
    pub fn shutdown(&self) {
        self.shared.lock().stop = true;
        self.shared.available.notify_all();

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if workers.is_empty() {
            return;
        }

        for worker in workers {
            if worker.join().is_err() {
                warn!("worker thread exited abnormally");
            }
        }
        debug!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: usize, shared: &Shared) {
    trace!(worker = index, "worker started");

    loop {
        let work = {
            let mut state = shared
                .available
                .wait_while(shared.lock(), |state| !state.stop && state.queue.is_empty())
                .unwrap_or_else(PoisonError::into_inner);

            match state.queue.pop_front() {
                Some(work) => {
                    state.active += 1;
                    work
                }
                None => break,
            }
        };

        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(work)) {
            warn!(
                worker = index,
                message = %panic_message(panic.as_ref()),
                "work unit panicked"
            );
        }

        let now_idle = {
            let mut state = shared.lock();
            state.active -= 1;
            state.active == 0 && state.queue.is_empty()
        };
        if now_idle && let Some(on_idle) = &shared.on_idle {
            on_idle();
        }
    }

    trace!(worker = index, "worker exiting");
}

/// Extracts the message of a caught panic when it is a string.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
