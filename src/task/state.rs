//! Shared coroutine state.
//!
//! One [`CoroutineState`] is shared, through an `Arc`, between the task
//! handle, every job that captures it, and every waker derived from it.
//! Jobs hold the state strongly; the state holds its dispatcher weakly, so
//! a pending job never keeps a dispatcher alive.

use crate::dispatch::Dispatcher;
use crate::task::TaskId;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::Waker;

/// Lifecycle of a task.
///
/// `Created → Started → Finished`, with `Created` and `Started` also able
/// to move to `Canceled`. The two right-hand states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoroutineStatus {
    Created = 0,
    Started = 1,
    Finished = 2,
    Canceled = 3,
}

impl CoroutineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CoroutineStatus::Finished | CoroutineStatus::Canceled)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => CoroutineStatus::Created,
            1 => CoroutineStatus::Started,
            2 => CoroutineStatus::Finished,
            3 => CoroutineStatus::Canceled,
            _ => unreachable!("invalid status discriminant"),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct StateFlags: u8 {
        /// Ownership of reclamation has moved to the completion job; the
        /// handle's drop is inert and awaiting is forbidden.
        const DETACHED = 1;

        /// The result (value or panic) has been taken; the handle can no
        /// longer produce anything.
        const CONSUMED = 1 << 1;
    }
}

// Notify protocol. At most one resume job per frame is in flight; wakes
// that arrive while the frame is being polled are coalesced into one
// reschedule instead of a concurrent resume.
const NOTIFY_IDLE: u8 = 0;
const NOTIFY_SCHEDULED: u8 = 1;
const NOTIFY_RUNNING: u8 = 2;
const NOTIFY_WOKEN: u8 = 3;

/// The suspended computation: the anonymous state machine an `async` block
/// compiles to, resumed by polling.
pub(crate) type Frame<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub(crate) struct StateInner<T> {
    pub(crate) dispatcher: Option<Weak<dyn Dispatcher>>,
    pub(crate) flags: StateFlags,
    pub(crate) frame: Option<Frame<T>>,
    pub(crate) value: Option<T>,
    pub(crate) panic: Option<Box<dyn Any + Send>>,
    pub(crate) awaiter: Option<Waker>,
}

pub(crate) struct CoroutineState<T> {
    status: AtomicU8,
    frame_done: AtomicBool,
    notify: AtomicU8,
    completion_posted: AtomicBool,
    pub(crate) inner: Mutex<StateInner<T>>,
}

impl<T> CoroutineState<T> {
    pub(crate) fn new(frame: Frame<T>) -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU8::new(CoroutineStatus::Created as u8),
            frame_done: AtomicBool::new(false),
            notify: AtomicU8::new(NOTIFY_IDLE),
            completion_posted: AtomicBool::new(false),
            inner: Mutex::new(StateInner {
                dispatcher: None,
                flags: StateFlags::empty(),
                frame: Some(frame),
                value: None,
                panic: None,
                awaiter: None,
            }),
        })
    }

    /// The frame's id: the address of this shared state.
    pub(crate) fn key(&self) -> TaskId {
        TaskId(self as *const Self as *const () as usize)
    }

    pub(crate) fn status(&self) -> CoroutineStatus {
        CoroutineStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Callers hold the inner lock across any multi-field transition.
    pub(crate) fn set_status(&self, status: CoroutineStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn is_frame_done(&self) -> bool {
        self.frame_done.load(Ordering::Acquire)
    }

    pub(crate) fn set_frame_done(&self) {
        self.frame_done.store(true, Ordering::Release);
    }

    /// True exactly once: the first resume posts the completion job.
    pub(crate) fn take_completion_ticket(&self) -> bool {
        !self.completion_posted.swap(true, Ordering::AcqRel)
    }

    /// Mark the initial resume job as in flight (launch path).
    pub(crate) fn set_scheduled(&self) {
        self.notify.store(NOTIFY_SCHEDULED, Ordering::Release);
    }

    /// Wake path. Returns true when the caller must dispatch a resume job.
    pub(crate) fn transition_to_scheduled(&self) -> bool {
        loop {
            match self.notify.load(Ordering::Acquire) {
                NOTIFY_IDLE => {
                    if self
                        .notify
                        .compare_exchange(
                            NOTIFY_IDLE,
                            NOTIFY_SCHEDULED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return true;
                    }
                }
                NOTIFY_RUNNING => {
                    // The in-flight resume reschedules after its poll.
                    if self
                        .notify
                        .compare_exchange(
                            NOTIFY_RUNNING,
                            NOTIFY_WOKEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Resume-job entry. A false return means the job is stale (the frame
    /// was cancelled or already resumed) and must do nothing.
    pub(crate) fn transition_to_running(&self) -> bool {
        self.notify
            .compare_exchange(
                NOTIFY_SCHEDULED,
                NOTIFY_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Resume-job exit with the frame still pending. Returns true when a
    /// wake arrived during the poll and a fresh resume job must be posted.
    pub(crate) fn transition_after_poll(&self) -> bool {
        loop {
            match self.notify.load(Ordering::Acquire) {
                NOTIFY_RUNNING => {
                    if self
                        .notify
                        .compare_exchange(
                            NOTIFY_RUNNING,
                            NOTIFY_IDLE,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return false;
                    }
                }
                NOTIFY_WOKEN => {
                    if self
                        .notify
                        .compare_exchange(
                            NOTIFY_WOKEN,
                            NOTIFY_SCHEDULED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }
}
