//! Thread-safe completion queue drained by the loop thread.
//!
//! Provides a FIFO of [`CompletionRecord`]s that any thread may push to, while
//! only the loop thread pops them or blocks waiting for them. Records come out
//! in the order they were pushed.

use crate::runtime::completion::CompletionRecord;

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct QueueState {
    records: VecDeque<CompletionRecord>,
    // Bumped by `wake`; lets a waiter return without a record.
    wakeups: u64,
}

/// A multi-producer, single-consumer FIFO of completion records.
///
/// The queue and its condition variable share one mutex, so the emptiness check
/// in [`CompletionQueue::wait`] and the wait itself cannot miss an enqueue.
pub struct CompletionQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl CompletionQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                records: VecDeque::new(),
                wakeups: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Appends a record and wakes the loop thread if it is waiting.
    ///
    /// Callable from any thread.
    ///
    /// # Arguments
    /// * `record` - The completion to deliver on the loop thread
    pub fn enqueue(&self, record: CompletionRecord) {
        self.lock().records.push_back(record);
        self.ready.notify_one();
    }

    /// Pops the oldest record without blocking.
    ///
    /// # Returns
    /// Some(record) if one is queued, None if the queue is empty
    pub fn dequeue(&self) -> Option<CompletionRecord> {
        self.lock().records.pop_front()
    }

    /// Checks if the queue is empty.
    ///
    /// # Returns
    /// true if no records are queued, false otherwise
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Number of queued records.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Blocks until a record is available or `timeout` elapses.
    ///
    /// Returns immediately when the queue is already non-empty.
    ///
    /// # Arguments
    /// * `timeout` - Longest time to block
    ///
    /// # Returns
    /// true if records are available when the wait ends, false on timeout
    pub fn wait(&self, timeout: Duration) -> bool {
        let epoch = self.epoch();
        self.wait_since(epoch, timeout)
    }

    /// Current wake generation, for a later [`CompletionQueue::wait_since`].
    pub(crate) fn epoch(&self) -> u64 {
        self.lock().wakeups
    }

    /// Like [`CompletionQueue::wait`], but also returns as soon as a
    /// [`CompletionQueue::wake`] has happened after `epoch` was read.
    pub(crate) fn wait_since(&self, epoch: u64, timeout: Duration) -> bool {
        let state = self.lock();
        if !state.records.is_empty() || state.wakeups != epoch {
            return !state.records.is_empty();
        }

        let (state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |state| {
                state.records.is_empty() && state.wakeups == epoch
            })
            .unwrap_or_else(PoisonError::into_inner);

        !state.records.is_empty()
    }

    /// Wakes a waiting loop thread without queueing a record.
    pub(crate) fn wake(&self) {
        let mut state = self.lock();
        state.wakeups = state.wakeups.wrapping_add(1);
        drop(state);
        self.ready.notify_all();
    }

    /// Drops every queued record without delivering it. Returns how many were dropped.
    pub(crate) fn discard(&self) -> usize {
        let drained: Vec<_> = self.lock().records.drain(..).collect();
        drained.len()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}
