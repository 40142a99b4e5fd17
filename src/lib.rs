//! taskling — a lightweight cooperative-coroutine runtime.
//!
//! Application code authors suspendable computations as `async` blocks and
//! schedules them onto pluggable execution contexts called *dispatchers*:
//! a job queue with time-gated and predicate-gated dispatch, retargetable
//! across a single-threaded event loop or a bounded worker pool.
//!
//! ```no_run
//! use std::time::Duration;
//! use taskling::{launch, sleep, EventLoopDispatcher};
//!
//! let event_loop = EventLoopDispatcher::new();
//! let handle = event_loop.clone();
//!
//! let out = event_loop
//!     .run(async move {
//!         let child = launch(&handle, async {
//!             sleep(Duration::from_millis(10)).await.unwrap();
//!             21
//!         });
//!         child.await.unwrap() * 2
//!     })
//!     .unwrap();
//!
//! assert_eq!(out, 42);
//! ```

pub mod callable;
pub use callable::Callable;

mod context;

pub mod dispatch;
pub use dispatch::{
    Dispatcher, DispatcherExt, EventLoopDispatcher, Job, WorkerPoolBuilder, WorkerPoolDispatcher,
};

pub mod task;
pub use task::{launch, launch_after, task, CoroutineStatus, JoinError, Task, TaskId};

pub mod time;
pub use time::{sleep, Sleep};

#[cfg(test)]
mod test_utils;
