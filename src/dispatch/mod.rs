//! Dispatchers: schedulers of [`Job`]s.
//!
//! A dispatcher exposes time-gated and predicate-gated dispatch plus
//! cancellation by id. Two reference implementations are provided — the
//! single-threaded [`EventLoopDispatcher`] and the bounded
//! [`WorkerPoolDispatcher`] — and anything implementing [`Dispatcher`]
//! (an I/O reactor, a UI thread, a test spy) can execute tasks.

use crate::callable::Callable;
use crate::task::{Task, TaskId};
use std::sync::Arc;
use std::time::Duration;

pub mod event_loop;
pub use self::event_loop::EventLoopDispatcher;

pub mod job;
pub use self::job::Job;

pub mod worker_pool;
pub use self::worker_pool::{WorkerPoolBuilder, WorkerPoolDispatcher};


/// A scheduler of jobs.
///
/// Implementations guarantee FIFO retrieval among jobs that are mutually
/// ready at the moment of dequeue; a non-ready job at the head is rotated
/// to the tail so other ready jobs may run.
pub trait Dispatcher: Send + Sync + 'static {
    /// Enqueue a job ready once `delay` has elapsed. `Duration::ZERO`
    /// means "as soon as possible".
    fn dispatch(&self, id: TaskId, delay: Duration, action: Callable);

    /// As [`Dispatcher::dispatch`], additionally gated on `predicate`:
    /// the job only runs once the predicate reports true. Predicates may
    /// be evaluated often and from queue-internal paths; they must be
    /// cheap and non-blocking.
    fn dispatch_when(
        &self,
        id: TaskId,
        delay: Duration,
        action: Callable,
        predicate: Callable<bool>,
    );

    /// Remove every pending job with this id. Idempotent and safe to call
    /// from any thread. A job already executing is not interrupted; only
    /// further pending jobs are prevented from running.
    fn cancel_jobs(&self, id: TaskId);
}

/// Extension methods available on every concrete dispatcher.
pub trait DispatcherExt: Dispatcher + Sized {
    /// An awaitable that completes after `duration`: an empty task
    /// launched with the supplied delay.
    fn sleep(self: &Arc<Self>, duration: Duration) -> Task<()> {
        crate::task::launch_after(self, duration, async {})
    }
}

impl<D: Dispatcher> DispatcherExt for D {}
