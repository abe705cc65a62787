//! External stop flag for forced shutdown of the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cloneable flag that asks [`Runtime::run`](crate::Runtime::run) to return early.
///
/// The loop checks the flag once per iteration, so a stop requested while the
/// loop is idle takes effect within one polling ceiling. Work already running
/// on the pool finishes normally; its completions are discarded.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Requests the loop to stop.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Checks whether a stop has been requested.
    ///
    /// # Returns
    /// true once [`StopHandle::stop`] has been called on any clone
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
