//! Thread-local task context.
//!
//! The runtime has no process-global "current dispatcher". Instead, the
//! harness installs a [`TaskContext`] for exactly the duration of a frame
//! poll; [`crate::time::sleep`] and the launch-on-await path read it to
//! discover the awaiting frame's dispatcher.

use crate::dispatch::Dispatcher;
use crate::task::TaskId;
use std::cell::RefCell;
use std::sync::{Arc, Weak};

#[derive(Clone)]
pub(crate) struct TaskContext {
    pub(crate) dispatcher: Weak<dyn Dispatcher>,
    pub(crate) task_id: TaskId,
}

thread_local! {
    static CURRENT: RefCell<Option<TaskContext>> = const { RefCell::new(None) };
}

/// Install `ctx` as the current task context until the guard drops.
///
/// Nested enters stack: the guard restores whatever was current before it.
pub(crate) fn enter(ctx: TaskContext) -> ContextGuard {
    let prev = CURRENT.with(|current| current.borrow_mut().replace(ctx));
    ContextGuard { prev }
}

pub(crate) struct ContextGuard {
    prev: Option<TaskContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|current| *current.borrow_mut() = prev);
    }
}

/// The dispatcher of the frame currently being polled on this thread, if
/// any and still alive.
pub(crate) fn current_dispatcher() -> Option<Arc<dyn Dispatcher>> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .and_then(|ctx| ctx.dispatcher.upgrade())
    })
}

pub(crate) fn current_task_id() -> Option<TaskId> {
    CURRENT.with(|current| current.borrow().as_ref().map(|ctx| ctx.task_id))
}
