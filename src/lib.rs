//! Completion and timer scheduling core for an embedded-script host.
//!
//! Blocking work runs on a pool of worker threads; results come back to a single
//! loop thread, the only thread that runs script-visible callbacks. Software
//! timers fire on that same thread.
//!
//! # Architecture
//!
//! - **CompletionQueue**: Multi-producer, single-consumer FIFO of completion records
//! - **WorkerPool**: Fixed set of threads running blocking work units
//! - **TimerRegistry**: One-shot and repeating timers fired in `(expiry, handle)` order
//! - **Runtime**: The driver loop composing the three, via `run()`
//! - **Spawner / Completer**: Cross-thread handles for submitting work and posting results
//! - **RuntimeBuilder**: Fluent builder for runtime configuration
//!
//! # Example
//!
//! ```ignore
//! use hostloop::Runtime;
//! use std::time::Duration;
//!
//! let mut rt = Runtime::builder().worker_threads(2).build()?;
//! let mut cx = rt.context();
//! cx.spawn_blocking(
//!     || Ok(std::fs::read_to_string("config.toml")?),
//!     |cx, text| {
//!         println!("loaded {} bytes", text?.len());
//!         cx.set_timeout(Duration::from_millis(100), Vec::new(), |_, _| Ok(()));
//!         Ok(())
//!     },
//! );
//! rt.run()?;
//! ```

mod builder;
mod error;
mod runtime;
mod time;
mod timer;

pub use builder::{DEFAULT_POLLING_CEILING, RuntimeBuilder};
pub use error::{BoxError, BuildError, RuntimeError, WorkError};
pub use runtime::{
    CheckpointHook, Completer, CompletionQueue, CompletionRecord, Exit, LoopContext, Payload,
    Runtime, Spawner, StopHandle, WorkUnit, WorkerPool,
};
pub use time::{Clock, ManualClock, MonotonicClock};
pub use timer::{MAX_DELAY, MIN_PERIOD, TimerArg, TimerArgs, TimerHandle, TimerMode, TimerRegistry};
