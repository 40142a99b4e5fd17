//! The bounded worker-pool dispatcher.
//!
//! A dedicated *operator* thread owns the pending-job queue: it finds the
//! first ready job (rotating non-ready heads to the tail) and hands its
//! action to a pooled worker. `min_workers` threads are spawned up front;
//! the pool grows on demand up to `max_workers` when a ready job finds no
//! idle worker. Dropping the dispatcher blocks until in-flight actions
//! return and every thread is joined.

use crate::callable::Callable;
use crate::dispatch::{Dispatcher, Job};
use crate::task::TaskId;
use anyhow::{anyhow, Context as _, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DEFAULT_MIN_WORKERS: usize = 1;

/// How long the operator dozes on an empty queue before re-checking.
/// Dispatch and shutdown both notify, so this is only a backstop.
const OPERATOR_IDLE_WAIT: Duration = Duration::from_millis(10);

/// How long the operator waits after a full rotation found nothing ready.
/// Bounds the latency of time-gated and predicate-gated jobs.
const OPERATOR_RESCAN_WAIT: Duration = Duration::from_micros(200);

/// How many yields a worker spends re-checking a false predicate before
/// handing the job back to the operator.
const PREDICATE_SPIN: usize = 16;

/// Backstop for workers waiting on the hand-off queue.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(50);

#[derive(Clone)]
struct ThreadNameFn(Arc<dyn Fn(usize) -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    ThreadNameFn(Arc::new(|n| format!("taskling-worker-{n}")))
}

/// Configures a [`WorkerPoolDispatcher`].
pub struct WorkerPoolBuilder {
    min_workers: usize,
    max_workers: Option<usize>,
    thread_name: ThreadNameFn,
    thread_stack_size: Option<usize>,
}

impl WorkerPoolBuilder {
    fn new() -> Self {
        Self {
            min_workers: DEFAULT_MIN_WORKERS,
            max_workers: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
        }
    }

    /// Workers spawned eagerly at construction. May be zero.
    pub fn min_workers(mut self, val: usize) -> Self {
        self.min_workers = val;
        self
    }

    /// Upper bound on pool size. Defaults to the available parallelism.
    pub fn max_workers(mut self, val: usize) -> Self {
        self.max_workers = Some(val);
        self
    }

    /// Base name for worker threads; a sequence number is appended.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move |n| format!("{val}-{n}")));
        self
    }

    /// Full control over worker thread names.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Stack size (in bytes) for worker threads.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Spawn the operator and the initial workers.
    ///
    /// Fails if the configuration is invalid or a thread cannot be
    /// spawned; a partial pool is shut down and joined before returning.
    pub fn try_build(self) -> Result<Arc<WorkerPoolDispatcher>> {
        let max_workers = match self.max_workers {
            Some(val) => val,
            None => thread::available_parallelism()
                .context("querying available parallelism")?
                .get(),
        };
        if max_workers == 0 {
            return Err(anyhow!("max_workers must be greater than 0"));
        }
        if self.min_workers > max_workers {
            return Err(anyhow!(
                "min_workers ({}) must not exceed max_workers ({})",
                self.min_workers,
                max_workers
            ));
        }

        let shared = Arc::new(Shared {
            min_workers: self.min_workers,
            max_workers,
            thread_name: self.thread_name,
            thread_stack_size: self.thread_stack_size,
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            ready: Mutex::new(VecDeque::new()),
            ready_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            idle_workers: AtomicUsize::new(0),
            worker_count: AtomicUsize::new(0),
            worker_seq: AtomicUsize::new(0),
            threads: Mutex::new(PoolThreads::default()),
        });

        let operator = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("taskling-operator".into())
                .spawn(move || operator_loop(&shared))
                .context("spawning the operator thread")?
        };
        shared.threads.lock().operator = Some(operator);

        for _ in 0..shared.min_workers {
            if let Err(e) = Shared::spawn_worker(&shared) {
                shared.begin_shutdown();
                shared.join_all();
                return Err(e).context("spawning an initial pool worker");
            }
        }

        Ok(Arc::new(WorkerPoolDispatcher { shared }))
    }
}

/// A bounded pool of worker threads fed by an operator thread.
pub struct WorkerPoolDispatcher {
    shared: Arc<Shared>,
}

impl WorkerPoolDispatcher {
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::new()
    }

    /// A pool with the given bounds and default thread configuration.
    pub fn try_new(min_workers: usize, max_workers: usize) -> Result<Arc<Self>> {
        Self::builder()
            .min_workers(min_workers)
            .max_workers(max_workers)
            .try_build()
    }

    #[cfg(test)]
    pub(crate) fn worker_count(&self) -> usize {
        self.shared.worker_count.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn pending_jobs(&self) -> usize {
        self.shared.queue.lock().len() + self.shared.ready.lock().len()
    }
}

impl Dispatcher for WorkerPoolDispatcher {
    fn dispatch(&self, id: TaskId, delay: Duration, action: Callable) {
        tracing::trace!(%id, ?delay, "worker pool: dispatch");
        self.shared
            .queue
            .lock()
            .push_back(Job::new(id, delay, action));
        self.shared.queue_cv.notify_one();
    }

    fn dispatch_when(&self, id: TaskId, delay: Duration, action: Callable, predicate: Callable<bool>) {
        tracing::trace!(%id, ?delay, "worker pool: gated dispatch");
        self.shared
            .queue
            .lock()
            .push_back(Job::gated(id, delay, action, predicate));
        self.shared.queue_cv.notify_one();
    }

    fn cancel_jobs(&self, id: TaskId) {
        // Pending records first, then records already claimed by the
        // operator but not yet picked up by a worker. An action that a
        // worker is executing is past the point of no return.
        {
            let mut queue = self.shared.queue.lock();
            queue.retain(|job| job.id() != id);
        }
        {
            let mut ready = self.shared.ready.lock();
            ready.retain(|item| item.id != id);
        }
        tracing::trace!(%id, "worker pool: cancel jobs");
    }
}

impl Drop for WorkerPoolDispatcher {
    fn drop(&mut self) {
        self.shared.begin_shutdown();
        self.shared.join_all();
        self.shared.queue.lock().clear();
        self.shared.ready.lock().clear();
        tracing::debug!("worker pool shut down");
    }
}

/// A claimed job on its way to a worker.
struct WorkItem {
    id: TaskId,
    action: Callable,
    predicate: Option<Callable<bool>>,
}

#[derive(Default)]
struct PoolThreads {
    operator: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
}

struct Shared {
    min_workers: usize,
    max_workers: usize,
    thread_name: ThreadNameFn,
    thread_stack_size: Option<usize>,

    /// Pending jobs, owned by the operator.
    queue: Mutex<VecDeque<Job>>,
    queue_cv: Condvar,

    /// Ready actions handed off to workers.
    ready: Mutex<VecDeque<WorkItem>>,
    ready_cv: Condvar,

    shutdown: AtomicBool,
    idle_workers: AtomicUsize,
    worker_count: AtomicUsize,
    worker_seq: AtomicUsize,
    threads: Mutex<PoolThreads>,
}

impl Shared {
    fn spawn_worker(shared: &Arc<Shared>) -> Result<()> {
        let seq = shared.worker_seq.fetch_add(1, Ordering::Relaxed);
        let mut builder = thread::Builder::new().name((shared.thread_name.0)(seq));
        if let Some(stack_size) = shared.thread_stack_size {
            builder = builder.stack_size(stack_size);
        }

        shared.worker_count.fetch_add(1, Ordering::AcqRel);
        shared.idle_workers.fetch_add(1, Ordering::AcqRel);

        let worker_shared = shared.clone();
        match builder.spawn(move || worker_loop(&worker_shared)) {
            Ok(handle) => {
                shared.threads.lock().workers.push(handle);
                Ok(())
            }
            Err(e) => {
                shared.worker_count.fetch_sub(1, Ordering::AcqRel);
                shared.idle_workers.fetch_sub(1, Ordering::AcqRel);
                Err(e).context("spawning a pool worker thread")
            }
        }
    }

    /// Pop the first ready job, rotating non-ready heads to the tail.
    /// Blocks (with timed waits) until a job is ready or shutdown begins.
    fn next_ready_job(&self) -> Option<Job> {
        let mut queue = self.queue.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            if queue.is_empty() {
                self.queue_cv.wait_for(&mut queue, OPERATOR_IDLE_WAIT);
                continue;
            }

            let now = Instant::now();
            for _ in 0..queue.len() {
                let head_ready = queue
                    .front()
                    .map(|job| job.is_ready(now))
                    .unwrap_or(false);
                if head_ready {
                    return queue.pop_front();
                }
                let head = queue.pop_front().expect("queue checked non-empty");
                queue.push_back(head);
            }

            // Full rotation, nothing ready yet.
            self.queue_cv.wait_for(&mut queue, OPERATOR_RESCAN_WAIT);
        }
    }

    /// Hand a ready job to the pool, growing it if everyone is busy.
    fn submit(self: &Arc<Self>, job: Job) {
        if self.idle_workers.load(Ordering::Acquire) == 0
            && self.worker_count.load(Ordering::Acquire) < self.max_workers
        {
            match Shared::spawn_worker(self) {
                Ok(()) => tracing::debug!(
                    workers = self.worker_count.load(Ordering::Acquire),
                    "grew worker pool"
                ),
                Err(e) => tracing::warn!(error = %e, "failed to grow worker pool"),
            }
        }

        let (id, action, predicate) = job.into_parts();
        self.ready.lock().push_back(WorkItem {
            id,
            action,
            predicate,
        });
        self.ready_cv.notify_one();
    }

    /// Run one claimed item on the calling worker.
    fn run_item(&self, item: WorkItem) {
        // The predicate is re-evaluated just before the action runs; a
        // still-false predicate sends the job back to the operator after a
        // bounded spin.
        let gate_closed = match &item.predicate {
            Some(predicate) => !predicate.call() && !spin_until(predicate),
            None => false,
        };
        if gate_closed {
            let WorkItem {
                id,
                action,
                predicate,
            } = item;
            let predicate = predicate.expect("gate_closed implies a predicate");
            self.queue
                .lock()
                .push_back(Job::gated(id, Duration::ZERO, action, predicate));
            self.queue_cv.notify_one();
            return;
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| item.action.call())) {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("<non-string payload>");
            tracing::error!(id = %item.id, message, "job action panicked on a pool worker");
        }
    }

    fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.queue_cv.notify_all();
        self.ready_cv.notify_all();
    }

    fn join_all(&self) {
        let (operator, workers) = {
            let mut threads = self.threads.lock();
            (threads.operator.take(), mem::take(&mut threads.workers))
        };
        if let Some(operator) = operator {
            let _ = operator.join();
        }
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn spin_until(predicate: &Callable<bool>) -> bool {
    for _ in 0..PREDICATE_SPIN {
        thread::yield_now();
        if predicate.call() {
            return true;
        }
    }
    false
}

fn operator_loop(shared: &Arc<Shared>) {
    while let Some(job) = shared.next_ready_job() {
        shared.submit(job);
    }
    // Shutdown: remaining records are discarded by the drop path.
}

fn worker_loop(shared: &Arc<Shared>) {
    loop {
        let item = {
            let mut ready = shared.ready.lock();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(item) = ready.pop_front() {
                    break item;
                }
                shared.ready_cv.wait_for(&mut ready, WORKER_IDLE_WAIT);
            }
        };

        shared.idle_workers.fetch_sub(1, Ordering::AcqRel);
        shared.run_item(item);
        shared.idle_workers.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::rstest;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::AtomicUsize;

    assert_impl_all!(WorkerPoolDispatcher: Dispatcher, Send, Sync);

    #[rstest]
    #[case::max_zero(1, 0)]
    #[case::min_above_max(4, 2)]
    fn test_invalid_bounds_are_rejected(#[case] min: usize, #[case] max: usize) {
        assert!(WorkerPoolDispatcher::try_new(min, max).is_err());
    }

    #[test]
    fn test_min_workers_are_spawned_eagerly() -> Result<()> {
        let pool = WorkerPoolDispatcher::try_new(2, 4)?;
        assert_eq!(pool.worker_count(), 2);
        Ok(())
    }

    #[test]
    fn test_builder_options_are_applied() -> Result<()> {
        let pool = WorkerPoolDispatcher::builder()
            .min_workers(1)
            .max_workers(2)
            .thread_name("pool-under-test")
            .thread_stack_size(512 * 1024)
            .try_build()?;

        let name = Arc::new(Mutex::new(String::new()));
        let captured = name.clone();
        pool.dispatch(
            TaskId(1),
            Duration::ZERO,
            Callable::new(move || {
                let current = thread::current();
                *captured.lock() = current.name().unwrap_or_default().to_owned();
            }),
        );

        wait_until(|| !name.lock().is_empty())?;
        assert!(name.lock().starts_with("pool-under-test-"));
        Ok(())
    }

    #[test]
    fn test_dispatched_action_runs_on_a_pool_thread() -> Result<()> {
        let pool = WorkerPoolDispatcher::try_new(1, 2)?;
        let count = Arc::new(AtomicUsize::new(0));
        let main_thread = thread::current().id();

        let captured = count.clone();
        pool.dispatch(
            TaskId(1),
            Duration::ZERO,
            Callable::new(move || {
                assert_ne!(thread::current().id(), main_thread);
                captured.fetch_add(1, Ordering::SeqCst);
            }),
        );

        wait_until(|| count.load(Ordering::SeqCst) == 1)?;
        Ok(())
    }

    #[test]
    fn test_delayed_action_respects_its_ready_time() -> Result<()> {
        let pool = WorkerPoolDispatcher::try_new(1, 2)?;
        let fired_at = Arc::new(Mutex::new(None));

        let start = Instant::now();
        let captured = fired_at.clone();
        pool.dispatch(
            TaskId(1),
            Duration::from_millis(50),
            Callable::new(move || {
                *captured.lock() = Some(Instant::now());
            }),
        );

        wait_until(|| fired_at.lock().is_some())?;
        let fired = fired_at.lock().expect("just observed");
        assert!(fired.duration_since(start) >= Duration::from_millis(50));
        Ok(())
    }

    #[test]
    fn test_cancel_jobs_prevents_execution() -> Result<()> {
        let pool = WorkerPoolDispatcher::try_new(1, 2)?;
        let count = Arc::new(AtomicUsize::new(0));

        let captured = count.clone();
        pool.dispatch(
            TaskId(9),
            Duration::from_millis(40),
            Callable::new(move || {
                captured.fetch_add(1, Ordering::SeqCst);
            }),
        );
        pool.cancel_jobs(TaskId(9));

        thread::sleep(Duration::from_millis(120));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(pool.pending_jobs(), 0);
        Ok(())
    }

    #[test]
    fn test_predicate_gates_execution_until_true() -> Result<()> {
        let pool = WorkerPoolDispatcher::try_new(1, 2)?;
        let gate = Arc::new(AtomicBool::new(false));
        let count = Arc::new(AtomicUsize::new(0));

        let gate_in = gate.clone();
        let captured = count.clone();
        pool.dispatch_when(
            TaskId(2),
            Duration::ZERO,
            Callable::new(move || {
                captured.fetch_add(1, Ordering::SeqCst);
            }),
            Callable::new(move || gate_in.load(Ordering::SeqCst)),
        );

        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        gate.store(true, Ordering::SeqCst);
        wait_until(|| count.load(Ordering::SeqCst) == 1)?;
        Ok(())
    }

    #[test]
    fn test_pool_grows_under_load_up_to_max() -> Result<()> {
        let pool = WorkerPoolDispatcher::try_new(1, 3)?;
        let started = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicUsize::new(0));

        // Occupy the single eager worker...
        let started_in = started.clone();
        let done_in = done.clone();
        pool.dispatch(
            TaskId(0),
            Duration::ZERO,
            Callable::new(move || {
                started_in.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(80));
                done_in.fetch_add(1, Ordering::SeqCst);
            }),
        );
        wait_until(|| started.load(Ordering::SeqCst))?;

        // ...so these two find no idle worker and force growth.
        for n in 1..3 {
            let done = done.clone();
            pool.dispatch(
                TaskId(n),
                Duration::ZERO,
                Callable::new(move || {
                    thread::sleep(Duration::from_millis(40));
                    done.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        wait_until(|| done.load(Ordering::SeqCst) == 3)?;
        assert!(pool.worker_count() > 1);
        assert!(pool.worker_count() <= 3);
        Ok(())
    }

    #[test]
    fn test_panicking_action_does_not_kill_the_worker() -> Result<()> {
        let pool = WorkerPoolDispatcher::try_new(1, 1)?;
        let count = Arc::new(AtomicUsize::new(0));

        pool.dispatch(
            TaskId(1),
            Duration::ZERO,
            Callable::new(|| panic!("worker bait")),
        );
        let captured = count.clone();
        pool.dispatch(
            TaskId(2),
            Duration::ZERO,
            Callable::new(move || {
                captured.fetch_add(1, Ordering::SeqCst);
            }),
        );

        wait_until(|| count.load(Ordering::SeqCst) == 1)?;
        Ok(())
    }

    #[test]
    fn test_drop_blocks_until_in_flight_actions_return() -> Result<()> {
        let pool = WorkerPoolDispatcher::try_new(1, 1)?;
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let started_in = started.clone();
        let finished_in = finished.clone();
        pool.dispatch(
            TaskId(1),
            Duration::ZERO,
            Callable::new(move || {
                started_in.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(80));
                finished_in.store(true, Ordering::SeqCst);
            }),
        );

        wait_until(|| started.load(Ordering::SeqCst))?;
        drop(pool);
        assert!(finished.load(Ordering::SeqCst));
        Ok(())
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(1));
        }
        Err(anyhow!("condition not met within 5s"))
    }
}
