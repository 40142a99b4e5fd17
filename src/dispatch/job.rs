use crate::callable::Callable;
use crate::task::TaskId;
use std::time::{Duration, Instant};

/// One scheduled unit of work.
///
/// A job is *ready* iff its ready time has passed and its predicate, if
/// any, reports true. The id ties the job to the coroutine frame it was
/// scheduled for, so [`cancel_jobs`](crate::dispatch::Dispatcher::cancel_jobs)
/// can remove every job belonging to one frame.
#[derive(Debug)]
pub struct Job {
    id: TaskId,
    ready_at: Instant,
    action: Callable,
    predicate: Option<Callable<bool>>,
}

impl Job {
    pub fn new(id: TaskId, delay: Duration, action: Callable) -> Self {
        Self {
            id,
            ready_at: Instant::now() + delay,
            action,
            predicate: None,
        }
    }

    pub fn gated(id: TaskId, delay: Duration, action: Callable, predicate: Callable<bool>) -> Self {
        Self {
            id,
            ready_at: Instant::now() + delay,
            action,
            predicate: Some(predicate),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        now >= self.ready_at && self.predicate.as_ref().map_or(true, Callable::call)
    }

    /// Run the job's action, consuming the job.
    pub fn run(self) {
        self.action.call();
    }

    pub(crate) fn into_parts(self) -> (TaskId, Callable, Option<Callable<bool>>) {
        (self.id, self.action, self.predicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_zero_delay_job_is_immediately_ready() {
        let job = Job::new(TaskId(1), Duration::ZERO, Callable::new(|| {}));
        assert!(job.is_ready(Instant::now()));
    }

    #[test]
    fn test_delayed_job_becomes_ready_at_its_instant() {
        let job = Job::new(TaskId(1), Duration::from_secs(60), Callable::new(|| {}));
        let now = Instant::now();
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + Duration::from_secs(61)));
    }

    #[test]
    fn test_predicate_gates_readiness() {
        let gate = Arc::new(AtomicBool::new(false));
        let captured = gate.clone();
        let job = Job::gated(
            TaskId(1),
            Duration::ZERO,
            Callable::new(|| {}),
            Callable::new(move || captured.load(Ordering::SeqCst)),
        );

        assert!(!job.is_ready(Instant::now()));
        gate.store(true, Ordering::SeqCst);
        assert!(job.is_ready(Instant::now()));
    }

    #[test]
    fn test_run_invokes_the_action() {
        let count = Arc::new(AtomicUsize::new(0));
        let captured = count.clone();
        let job = Job::new(
            TaskId(1),
            Duration::ZERO,
            Callable::new(move || {
                captured.fetch_add(1, Ordering::SeqCst);
            }),
        );

        job.run();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
