//! The task waker: waking a suspended frame posts a resume job for it on
//! its own dispatcher. Wakes of a done or cancelled frame are dropped, and
//! the notify protocol coalesces concurrent wakes so at most one resume
//! job is ever in flight.

use crate::task::harness::{self, RawTask};
use crate::task::state::CoroutineStatus;
use std::sync::Arc;
use std::task::Wake;
use std::time::Duration;

pub(crate) struct TaskWaker {
    raw: Arc<dyn RawTask>,
}

impl TaskWaker {
    pub(crate) fn new(raw: Arc<dyn RawTask>) -> Self {
        Self { raw }
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.raw.status() == CoroutineStatus::Canceled || self.raw.is_frame_done() {
            return;
        }
        if self.raw.transition_to_scheduled() {
            harness::schedule_resume(self.raw.clone(), Duration::ZERO);
        }
    }
}
