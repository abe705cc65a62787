//! Runtime subsystem modules.

pub(crate) mod completion;
pub(crate) mod context;
mod driver;
pub(crate) mod pool;
pub(crate) mod queue;
mod stop;

pub use completion::{Completer, CompletionRecord, Payload, WorkUnit};
pub use context::{LoopContext, Spawner};
pub use driver::{CheckpointHook, Exit, Runtime};
pub use pool::WorkerPool;
pub use queue::CompletionQueue;
pub use stop::StopHandle;
