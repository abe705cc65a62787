//! Completion records and the hand-off token used to produce them.
//!
//! A unit of blocking work runs on a worker thread and finishes by turning a
//! [`Completer`] into a [`CompletionRecord`]. The record moves through the
//! [`CompletionQueue`] and is consumed exactly once on the loop thread, where its
//! continuation receives the payload.
//!
//! Neither type is `Clone`: ownership of the payload moves from the worker to the
//! queue to the loop thread, and the record is gone once delivered.
//!
//! # Example
//!
//! ```ignore
//! let completer = spawner.completer();
//! spawner.submit(move || {
//!     let bytes = std::fs::read("data.bin").map_err(|e| e.to_string());
//!     completer.complete(bytes, |cx, bytes| {
//!         println!("read {:?} on the loop thread", bytes.map(|b| b.len()));
//!         Ok(())
//!     });
//! });
//! ```

use crate::runtime::context::LoopContext;
use crate::runtime::queue::CompletionQueue;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque payload carried by a completion record.
pub type Payload = Box<dyn Any + Send>;

/// Deferred blocking computation executed once by a worker thread.
pub type WorkUnit = Box<dyn FnOnce() + Send + 'static>;

type Continuation = Box<dyn FnOnce(&mut LoopContext<'_>, Payload) -> anyhow::Result<()> + Send>;

/// A payload plus the continuation that consumes it on the loop thread.
pub struct CompletionRecord {
    payload: Payload,
    continuation: Continuation,
}

impl CompletionRecord {
    /// Creates a record whose continuation receives the payload with its concrete type.
    ///
    /// # Arguments
    /// * `payload` - The value produced by the worker
    /// * `continuation` - Runs on the loop thread with the payload
    pub fn new<P, F>(payload: P, continuation: F) -> Self
    where
        P: Send + 'static,
        F: FnOnce(&mut LoopContext<'_>, P) -> anyhow::Result<()> + Send + 'static,
    {
        Self::from_parts(
            Box::new(payload),
            move |cx: &mut LoopContext<'_>, payload: Payload| match payload.downcast::<P>() {
                Ok(payload) => continuation(cx, *payload),
                Err(_) => Err(anyhow::anyhow!("completion payload has an unexpected type")),
            },
        )
    }

    /// Creates a record from an already type-erased payload.
    pub fn from_parts<F>(payload: Payload, continuation: F) -> Self
    where
        F: FnOnce(&mut LoopContext<'_>, Payload) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            payload,
            continuation: Box::new(continuation),
        }
    }

    /// Runs the continuation with the payload, consuming the record.
    pub(crate) fn deliver(self, cx: &mut LoopContext<'_>) -> anyhow::Result<()> {
        (self.continuation)(cx, self.payload)
    }

    #[cfg(test)]
    pub(crate) fn into_payload(self) -> Payload {
        self.payload
    }
}

impl fmt::Debug for CompletionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionRecord").finish_non_exhaustive()
    }
}

/// Move-only token that lets a worker post exactly one completion.
///
/// Obtained from [`Spawner::completer`](crate::Spawner::completer) on the
/// submitting side and moved into the work closure. Dropping it without
/// completing posts nothing.
#[must_use = "a completer posts nothing unless `complete` or `send` is called"]
pub struct Completer {
    completions: Arc<CompletionQueue>,
}

impl Completer {
    pub(crate) fn new(completions: Arc<CompletionQueue>) -> Self {
        Self { completions }
    }

    /// Posts `payload` to the loop thread, where `continuation` will consume it.
    ///
    /// # Arguments
    /// * `payload` - The value handed to the continuation
    /// * `continuation` - Runs exactly once on the loop thread
    pub fn complete<P, F>(self, payload: P, continuation: F)
    where
        P: Send + 'static,
        F: FnOnce(&mut LoopContext<'_>, P) -> anyhow::Result<()> + Send + 'static,
    {
        self.send(CompletionRecord::new(payload, continuation));
    }

    /// Posts a prebuilt record.
    pub fn send(self, record: CompletionRecord) {
        self.completions.enqueue(record);
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").finish_non_exhaustive()
    }
}
