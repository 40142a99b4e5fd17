//! Test-only dispatcher spy.

use crate::callable::Callable;
use crate::dispatch::Dispatcher;
use crate::task::TaskId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchCall {
    Dispatch { id: TaskId, delay: Duration },
    DispatchWhen { id: TaskId, delay: Duration },
    CancelJobs { id: TaskId },
}

/// Records every dispatcher call and runs nothing: jobs are dropped on the
/// floor, which lets tests observe the protocol without any execution.
pub(crate) struct RecordingDispatcher {
    calls: Mutex<Vec<DispatchCall>>,
}

impl RecordingDispatcher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> Vec<DispatchCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn cancelled_ids(&self) -> Vec<TaskId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                DispatchCall::CancelJobs { id } => Some(*id),
                _ => None,
            })
            .collect()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch(&self, id: TaskId, delay: Duration, _action: Callable) {
        self.calls.lock().push(DispatchCall::Dispatch { id, delay });
    }

    fn dispatch_when(
        &self,
        id: TaskId,
        delay: Duration,
        _action: Callable,
        _predicate: Callable<bool>,
    ) {
        self.calls
            .lock()
            .push(DispatchCall::DispatchWhen { id, delay });
    }

    fn cancel_jobs(&self, id: TaskId) {
        self.calls.lock().push(DispatchCall::CancelJobs { id });
    }
}
