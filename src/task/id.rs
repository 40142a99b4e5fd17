use crate::context;
use std::fmt;

/// An opaque ID shared by every job that belongs to one coroutine frame.
///
/// Derived from the address of the frame's shared state, so all jobs
/// scheduled on behalf of a frame can be cancelled together with
/// [`Dispatcher::cancel_jobs`](crate::dispatch::Dispatcher::cancel_jobs).
/// An ID may be re-used after the frame and every handle and job holding
/// its state are gone.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) usize);

impl fmt::Debug for TaskId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "TaskId({:#x})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{:#x}", self.0)
    }
}

/// Returns the [`TaskId`] of the currently running task.
///
/// # Panics
///
/// Panics if called from outside a task frame.
pub fn id() -> TaskId {
    context::current_task_id().expect("not inside a task frame")
}

/// Returns the [`TaskId`] of the currently running task, or `None` when
/// called outside of a task frame.
pub fn try_id() -> Option<TaskId> {
    context::current_task_id()
}
