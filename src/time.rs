//! Time-gated suspension.
//!
//! [`sleep`] is the free-function form bound to the *current* dispatcher —
//! the one driving the awaiting frame — discovered through the task
//! context at first poll. The dispatcher-bound form is
//! [`DispatcherExt::sleep`](crate::dispatch::DispatcherExt::sleep).

use crate::context;
use crate::task::{JoinError, Task};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Completes no earlier than `duration` from the first poll.
///
/// Must be awaited from inside a task; elsewhere there is no dispatcher to
/// carry the timer and the await yields [`JoinError::NoDispatcher`].
/// `Duration::ZERO` completes as soon as the dispatcher gets to it.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        timer: None,
    }
}

/// Future returned by [`sleep`]: an empty task launched with the requested
/// delay on the awaiting frame's dispatcher.
#[derive(Debug)]
pub struct Sleep {
    duration: Duration,
    timer: Option<Task<()>>,
}

impl Future for Sleep {
    type Output = Result<(), JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.timer.is_none() {
            let Some(dispatcher) = context::current_dispatcher() else {
                return Poll::Ready(Err(JoinError::NoDispatcher));
            };
            let timer = crate::task::task(async {});
            timer
                .launch_dyn(dispatcher, this.duration)
                .expect("a freshly created timer task cannot already be launched");
            this.timer = Some(timer);
        }

        Pin::new(this.timer.as_mut().expect("timer installed above")).poll(cx)
    }
}
