//! Error types surfaced by the loop core.
//!
//! Three failure classes exist:
//!
//! - Failures inside blocking work are contained at the worker boundary and
//!   delivered to the loop thread as a [`WorkError`].
//! - Failures raised by a continuation, a timer callback or the checkpoint hook
//!   end [`Runtime::run`](crate::Runtime::run) with a [`RuntimeError`]. Nothing
//!   else is processed once one of these is returned.
//! - Misuse such as cancelling a stale timer handle is silent and has no error.

use crate::timer::TimerHandle;

/// Boxed error used as the source of loop and work failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Fatal failure that ended [`Runtime::run`](crate::Runtime::run).
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A completion continuation returned an error.
    #[error("completion continuation failed: {source}")]
    Completion { source: BoxError },

    /// A timer callback returned an error; remaining due timers were not run.
    #[error("timer {handle} callback failed: {source}")]
    Timer { handle: TimerHandle, source: BoxError },

    /// The checkpoint hook returned an error.
    #[error("checkpoint hook failed: {source}")]
    Checkpoint { source: BoxError },
}

/// Failure of a unit submitted through [`Spawner::spawn_blocking`](crate::Spawner::spawn_blocking).
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    /// The work closure returned an error.
    #[error("blocking work failed: {0}")]
    Failed(#[source] BoxError),

    /// The work closure panicked. Holds the panic message when it was a string.
    #[error("blocking work panicked: {0}")]
    Panicked(String),
}

/// Failure while building a [`Runtime`](crate::Runtime).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn worker thread {index}: {source}")]
    SpawnWorker {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}
