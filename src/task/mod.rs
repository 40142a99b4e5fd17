//! Tasks: suspendable computations and their handles.
//!
//! A [`Task<T>`] is the move-only public handle to one suspendable
//! computation. Create one in the CREATED state with [`task`], or create
//! and launch in one step with [`launch`] / [`launch_after`]. Awaiting a
//! handle yields `Result<T, JoinError>`; a CREATED task awaited inside
//! another task is launched on the awaiter's dispatcher first.
//!
//! Dropping a live, non-detached handle cancels the task. [`Task::detach`]
//! turns the task fire-and-forget: the completion job reclaims everything
//! and the handle becomes inert.

use crate::context;
use crate::dispatch::Dispatcher;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

mod error;
pub use self::error::{JoinError, PanicPayload};

pub(crate) mod harness;
pub(crate) use self::harness::RawTask;

pub mod id;
pub use self::id::{id, try_id, TaskId};

pub(crate) mod state;
pub use self::state::CoroutineStatus;
pub(crate) use self::state::{CoroutineState, StateFlags};

mod waker;

/// Create a task in the CREATED state, not yet bound to any dispatcher.
///
/// Launch it explicitly with [`Task::launch_on`], or await it from inside
/// another task to launch it on the awaiter's dispatcher.
pub fn task<F>(future: F) -> Task<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Task {
        state: CoroutineState::new(Box::pin(future)),
    }
}

/// Create a task and launch it on `dispatcher` immediately.
pub fn launch<D, F>(dispatcher: &Arc<D>, future: F) -> Task<F::Output>
where
    D: Dispatcher,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    launch_after(dispatcher, Duration::ZERO, future)
}

/// Create a task and launch it on `dispatcher` with its first resume
/// delayed by `delay`.
pub fn launch_after<D, F>(dispatcher: &Arc<D>, delay: Duration, future: F) -> Task<F::Output>
where
    D: Dispatcher,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let task = task(future);
    task.launch_on_after(dispatcher, delay)
        .expect("a freshly created task cannot already be launched");
    task
}

/// A move-only handle to a suspendable computation.
///
/// The handle owns one strong reference to the task's shared state; jobs
/// scheduled on the task's behalf hold further strong references, so the
/// state outlives pending jobs even after the handle is gone.
pub struct Task<T: Send + 'static> {
    pub(crate) state: Arc<CoroutineState<T>>,
}

impl<T: Send + 'static> Task<T> {
    /// Launch on `dispatcher`, scheduling the first resume immediately.
    pub fn launch_on<D: Dispatcher>(&self, dispatcher: &Arc<D>) -> Result<(), JoinError> {
        self.launch_on_after(dispatcher, Duration::ZERO)
    }

    /// Launch on `dispatcher` with the first resume delayed by `delay`.
    ///
    /// Fails with [`JoinError::AlreadyLaunched`] if the task has left the
    /// CREATED state.
    pub fn launch_on_after<D: Dispatcher>(
        &self,
        dispatcher: &Arc<D>,
        delay: Duration,
    ) -> Result<(), JoinError> {
        self.launch_dyn(dispatcher.clone(), delay)
    }

    pub(crate) fn launch_dyn(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
        delay: Duration,
    ) -> Result<(), JoinError> {
        {
            let mut inner = self.state.inner.lock();
            if self.state.status() != CoroutineStatus::Created {
                return Err(JoinError::AlreadyLaunched);
            }
            inner.dispatcher = Some(Arc::downgrade(&dispatcher));
            self.state.set_status(CoroutineStatus::Started);
            self.state.set_scheduled();
        }
        harness::schedule_resume(self.state.clone() as Arc<dyn RawTask>, delay);
        Ok(())
    }

    /// The id shared by every job scheduled on this task's behalf.
    pub fn id(&self) -> TaskId {
        self.state.key()
    }

    pub fn status(&self) -> CoroutineStatus {
        self.state.status()
    }

    /// True once the frame has run to completion and was not cancelled.
    ///
    /// May lead [`Task::status`] briefly: the FINISHED transition happens
    /// in the completion job.
    pub fn is_finished(&self) -> bool {
        self.state.is_frame_done() && self.state.status() != CoroutineStatus::Canceled
    }

    /// Whether this handle can still produce a result or control the task.
    pub fn is_live(&self) -> bool {
        let consumed_or_detached = self
            .state
            .inner
            .lock()
            .flags
            .intersects(StateFlags::DETACHED | StateFlags::CONSUMED);
        !consumed_or_detached && self.state.status() != CoroutineStatus::Canceled
    }

    /// Cancel the task.
    ///
    /// Removes every pending job with this task's id from its dispatcher,
    /// moves a non-terminal status to CANCELED, and destroys the frame. A
    /// job already executing is not interrupted; it observes CANCELED and
    /// short-circuits. Idempotent; a no-op on a FINISHED task's status.
    pub fn cancel(&self) {
        let (frame, dispatcher) = {
            let mut inner = self.state.inner.lock();
            if !self.state.status().is_terminal() {
                self.state.set_status(CoroutineStatus::Canceled);
            }
            inner.awaiter = None;
            (
                inner.frame.take(),
                inner.dispatcher.as_ref().and_then(Weak::upgrade),
            )
        };
        drop(frame);
        if let Some(dispatcher) = dispatcher {
            dispatcher.cancel_jobs(self.state.key());
        }
    }

    /// Transfer ownership of the frame to the completion path, making the
    /// task fire-and-forget.
    ///
    /// After detaching, dropping the handle no longer cancels and awaiting
    /// it fails with [`JoinError::Detached`]. A no-op before launch. If the
    /// task already finished, residual jobs are reclaimed immediately.
    pub fn detach(&self) {
        let cleanup = {
            let mut inner = self.state.inner.lock();
            if inner.dispatcher.is_none() {
                return;
            }
            inner.flags.insert(StateFlags::DETACHED);
            inner.awaiter = None;
            if self.state.status() == CoroutineStatus::Finished {
                inner.dispatcher.as_ref().and_then(Weak::upgrade)
            } else {
                None
            }
        };
        if let Some(dispatcher) = cleanup {
            dispatcher.cancel_jobs(self.state.key());
        }
    }

    /// Consume the latched panic payload, if the frame panicked. Yields
    /// the payload at most once.
    pub fn take_panic(&self) -> Option<Box<dyn Any + Send + 'static>> {
        self.state.inner.lock().panic.take()
    }

    /// Try to resolve the task immediately, without blocking.
    ///
    /// Polls the task once. A finished task yields its result; an
    /// unfinished one is detached — it keeps running in the background —
    /// and [`JoinError::Cancelled`] is returned. Useful in synchronous
    /// contexts where awaiting is not possible.
    pub fn try_result(self) -> Result<T, JoinError> {
        let mut this = self;
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        match Pin::new(&mut this).poll(&mut cx) {
            Poll::Ready(result) => result,
            Poll::Pending => {
                this.detach();
                Err(JoinError::Cancelled)
            }
        }
    }
}

impl<T: Send + 'static> Future for Task<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let state = &self.get_mut().state;
        let mut inner = state.inner.lock();

        if inner.flags.contains(StateFlags::CONSUMED) {
            return Poll::Ready(Err(JoinError::AlreadyJoined));
        }
        if inner.flags.contains(StateFlags::DETACHED) {
            return Poll::Ready(Err(JoinError::Detached));
        }

        match state.status() {
            CoroutineStatus::Canceled => Poll::Ready(Err(JoinError::Cancelled)),
            CoroutineStatus::Created => {
                // The await transform: launch on the awaiter's dispatcher.
                let Some(dispatcher) = context::current_dispatcher() else {
                    return Poll::Ready(Err(JoinError::NoDispatcher));
                };
                inner.dispatcher = Some(Arc::downgrade(&dispatcher));
                state.set_status(CoroutineStatus::Started);
                state.set_scheduled();
                inner.awaiter = Some(cx.waker().clone());
                drop(inner);
                harness::schedule_resume(state.clone() as Arc<dyn RawTask>, Duration::ZERO);
                Poll::Pending
            }
            CoroutineStatus::Finished => {
                inner.flags.insert(StateFlags::CONSUMED);
                let result = if let Some(payload) = inner.panic.take() {
                    Err(JoinError::panicked(payload))
                } else if let Some(value) = inner.value.take() {
                    Ok(value)
                } else {
                    // Value stolen through `take_panic`-style paths.
                    Err(JoinError::AlreadyJoined)
                };
                let dispatcher = inner.dispatcher.as_ref().and_then(Weak::upgrade);
                drop(inner);
                // Release: the completion job may still sit in the queue.
                if let Some(dispatcher) = dispatcher {
                    dispatcher.cancel_jobs(state.key());
                }
                Poll::Ready(result)
            }
            CoroutineStatus::Started => {
                inner.awaiter = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T: Send + 'static> Drop for Task<T> {
    fn drop(&mut self) {
        let inert = self
            .state
            .inner
            .lock()
            .flags
            .intersects(StateFlags::DETACHED | StateFlags::CONSUMED);
        if !inert {
            self.cancel();
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Task<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Task")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}
