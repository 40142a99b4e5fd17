//! The single-threaded event-loop dispatcher, the default "main" driver.

use crate::callable::Callable;
use crate::dispatch::{Dispatcher, Job};
use crate::task::{CoroutineStatus, JoinError, Task, TaskId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Yield this many idle ticks before parking instead of spinning.
const IDLE_SPIN_TICKS: u32 = 64;

/// How long to park once spinning has produced nothing.
const IDLE_PARK: Duration = Duration::from_micros(100);

/// A FIFO job queue drained by a run loop on the calling thread.
///
/// [`EventLoopDispatcher::run`] drives a root task until it completes and
/// no jobs remain; tasks launched on this dispatcher only make progress
/// while `run` is executing.
pub struct EventLoopDispatcher {
    queue: Mutex<VecDeque<Job>>,
}

impl EventLoopDispatcher {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Launch `root` on this dispatcher and drive the loop until the root
    /// completes and the queue is empty.
    ///
    /// A panic escaping the root is surfaced as [`JoinError::Panicked`]
    /// as soon as it is observed.
    pub fn run<F>(self: &Arc<Self>, root: F) -> Result<F::Output, JoinError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.run_task(crate::task::task(root))
    }

    /// As [`EventLoopDispatcher::run`], for a pre-built task. A CREATED
    /// task is launched here first; a task bound to a different dispatcher
    /// cannot be driven and reports [`JoinError::Stalled`].
    pub fn run_task<T: Send + 'static>(self: &Arc<Self>, root: Task<T>) -> Result<T, JoinError> {
        if root.status() == CoroutineStatus::Created {
            root.launch_on(self)?;
        }

        let mut idle_ticks: u32 = 0;
        loop {
            if let Some(payload) = root.take_panic() {
                root.cancel();
                return Err(JoinError::panicked(payload));
            }
            if self.queue.lock().is_empty() {
                break;
            }
            if self.tick() {
                idle_ticks = 0;
            } else if idle_ticks < IDLE_SPIN_TICKS {
                idle_ticks += 1;
                thread::yield_now();
            } else {
                thread::park_timeout(IDLE_PARK);
            }
        }

        if root.status() != CoroutineStatus::Finished {
            return Err(JoinError::Stalled);
        }
        root.try_result()
    }

    /// One scheduling step. A ready head is moved out and invoked with the
    /// lock dropped; a non-ready head is rotated to the tail. Returns
    /// whether an action ran.
    fn tick(&self) -> bool {
        let job = {
            let mut queue = self.queue.lock();
            let ready = match queue.front() {
                None => return false,
                Some(head) => head.is_ready(Instant::now()),
            };
            if ready {
                queue.pop_front()
            } else {
                let head = queue.pop_front().expect("queue checked non-empty");
                queue.push_back(head);
                None
            }
        };

        match job {
            Some(job) => {
                job.run();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_jobs(&self) -> usize {
        self.queue.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn has_jobs_for(&self, id: TaskId) -> bool {
        self.queue.lock().iter().any(|job| job.id() == id)
    }
}

impl Dispatcher for EventLoopDispatcher {
    fn dispatch(&self, id: TaskId, delay: Duration, action: Callable) {
        tracing::trace!(%id, ?delay, "event loop: dispatch");
        self.queue.lock().push_back(Job::new(id, delay, action));
    }

    fn dispatch_when(&self, id: TaskId, delay: Duration, action: Callable, predicate: Callable<bool>) {
        tracing::trace!(%id, ?delay, "event loop: gated dispatch");
        self.queue
            .lock()
            .push_back(Job::gated(id, delay, action, predicate));
    }

    fn cancel_jobs(&self, id: TaskId) {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|job| job.id() != id);
        tracing::trace!(%id, removed = before - queue.len(), "event loop: cancel jobs");
    }
}
