//! Drives a frame through resume and completion jobs.
//!
//! The launch protocol posts a resume job whose body is [`RawTask::resume`]:
//! poll the frame once, and on the first resume also post the *completion
//! job* — [`RawTask::complete`] gated on the frame being done. Subsequent
//! resumes are posted by the task's waker. Everything here is type-erased
//! behind [`RawTask`] so jobs and wakers need no knowledge of the frame's
//! output type.

use crate::callable::Callable;
use crate::context::{self, TaskContext};
use crate::dispatch::Dispatcher;
use crate::task::state::{CoroutineState, CoroutineStatus, StateFlags};
use crate::task::waker::TaskWaker;
use crate::task::TaskId;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Type-erased view of a [`CoroutineState`], the receiver of every job the
/// runtime schedules on a frame's behalf.
pub(crate) trait RawTask: Send + Sync + 'static {
    /// Resume-job body: poll the frame up to its next suspension point.
    fn resume(self: Arc<Self>);

    /// Completion-job body: transition to FINISHED and hand off.
    fn complete(self: Arc<Self>);

    fn is_frame_done(&self) -> bool;

    fn task_id(&self) -> TaskId;

    fn status(&self) -> CoroutineStatus;

    /// The bound dispatcher, if still alive.
    fn dispatcher(&self) -> Option<Arc<dyn Dispatcher>>;

    /// Wake path of the notify protocol; see [`CoroutineState`].
    fn transition_to_scheduled(&self) -> bool;
}

/// Post a resume job for `raw` on its own dispatcher.
pub(crate) fn schedule_resume(raw: Arc<dyn RawTask>, delay: Duration) {
    let Some(dispatcher) = raw.dispatcher() else {
        return;
    };
    let id = raw.task_id();
    dispatcher.dispatch(
        id,
        delay,
        Callable::new(move || raw.clone().resume()),
    );
}

/// Post the completion job for `raw`, gated on the frame being done.
fn post_completion(raw: Arc<dyn RawTask>) {
    let Some(dispatcher) = raw.dispatcher() else {
        return;
    };
    let id = raw.task_id();
    let predicate = {
        let raw = raw.clone();
        Callable::new(move || raw.is_frame_done())
    };
    dispatcher.dispatch_when(
        id,
        Duration::ZERO,
        Callable::new(move || raw.clone().complete()),
        predicate,
    );
}

impl<T: Send + 'static> RawTask for CoroutineState<T> {
    fn resume(self: Arc<Self>) {
        if !self.transition_to_running() {
            return;
        }
        if self.status() == CoroutineStatus::Canceled || self.is_frame_done() {
            return;
        }

        // Take the frame out of the slot so a concurrent cancel cannot free
        // it mid-poll; cancel observing an empty slot only flips the status.
        let (frame, dispatcher) = {
            let mut inner = self.inner.lock();
            (inner.frame.take(), inner.dispatcher.clone())
        };
        let Some(mut frame) = frame else {
            return;
        };
        let Some(dispatcher) = dispatcher else {
            return;
        };

        let poll = {
            let _ctx = context::enter(TaskContext {
                dispatcher,
                task_id: self.key(),
            });
            let waker = Waker::from(Arc::new(TaskWaker::new(
                self.clone() as Arc<dyn RawTask>
            )));
            let mut cx = Context::from_waker(&waker);
            panic::catch_unwind(AssertUnwindSafe(|| frame.as_mut().poll(&mut cx)))
        };

        let mut finished = false;
        {
            let mut inner = self.inner.lock();
            match poll {
                Err(payload) => {
                    inner.panic = Some(payload);
                    finished = true;
                }
                Ok(Poll::Ready(value)) => {
                    inner.value = Some(value);
                    finished = true;
                }
                Ok(Poll::Pending) => {
                    if self.status() == CoroutineStatus::Canceled {
                        // Cancelled at a suspension point: short-circuit to
                        // frame destruction by not storing it back.
                        drop(frame);
                    } else {
                        inner.frame = Some(frame);
                    }
                }
            }
        }
        if finished {
            self.set_frame_done();
        }

        if self.take_completion_ticket() {
            post_completion(self.clone());
        }

        if !finished && self.transition_after_poll() {
            schedule_resume(self, Duration::ZERO);
        }
    }

    fn complete(self: Arc<Self>) {
        let mut inner = self.inner.lock();
        if self.status() == CoroutineStatus::Canceled {
            return;
        }
        self.set_status(CoroutineStatus::Finished);

        if let Some(awaiter) = inner.awaiter.take() {
            drop(inner);
            awaiter.wake();
        } else if inner.flags.contains(StateFlags::DETACHED) {
            if inner.panic.is_some() {
                tracing::warn!(id = %self.key(), "detached task panicked; payload dropped");
            }
            let dispatcher = inner.dispatcher.as_ref().and_then(Weak::upgrade);
            drop(inner);
            if let Some(dispatcher) = dispatcher {
                dispatcher.cancel_jobs(self.key());
            }
        }
    }

    fn is_frame_done(&self) -> bool {
        CoroutineState::is_frame_done(self)
    }

    fn task_id(&self) -> TaskId {
        self.key()
    }

    fn status(&self) -> CoroutineStatus {
        CoroutineState::status(self)
    }

    fn dispatcher(&self) -> Option<Arc<dyn Dispatcher>> {
        self.inner
            .lock()
            .dispatcher
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn transition_to_scheduled(&self) -> bool {
        CoroutineState::transition_to_scheduled(self)
    }
}
