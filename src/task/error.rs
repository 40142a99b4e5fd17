use std::any::Any;
use std::fmt;

/// A latched panic payload carried inside [`JoinError::Panicked`].
pub struct PanicPayload(pub(crate) Box<dyn Any + Send + 'static>);

impl PanicPayload {
    /// Best-effort panic message, for display purposes.
    fn message(&self) -> Option<&str> {
        if let Some(s) = self.0.downcast_ref::<&'static str>() {
            Some(s)
        } else {
            self.0.downcast_ref::<String>().map(String::as_str)
        }
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => write!(fmt, "PanicPayload({message:?})"),
            None => write!(fmt, "PanicPayload(..)"),
        }
    }
}

/// Everything that can go wrong at the task surface.
///
/// `Cancelled` is how awaiting a cancelled task reports; cancellation
/// itself is a status, not an error. `Panicked` carries the payload that
/// escaped the frame, latched on the state and surfaced at most once.
/// The remaining variants are invalid uses, surfaced synchronously from
/// the first poll that observes them.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("task was cancelled")]
    Cancelled,

    #[error("task panicked")]
    Panicked(PanicPayload),

    #[error("task was detached and cannot be awaited")]
    Detached,

    #[error("task result was already taken")]
    AlreadyJoined,

    #[error("no dispatcher is available on this thread")]
    NoDispatcher,

    #[error("task has already been launched")]
    AlreadyLaunched,

    #[error("dispatcher ran out of jobs before the root task completed")]
    Stalled,
}

impl JoinError {
    pub(crate) fn panicked(payload: Box<dyn Any + Send + 'static>) -> Self {
        JoinError::Panicked(PanicPayload(payload))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JoinError::Cancelled)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, JoinError::Panicked(_))
    }

    /// True for every misuse of the awaiting protocol: awaiting a
    /// cancelled, detached, never-launchable, or already-consumed task.
    pub fn is_invalid_use(&self) -> bool {
        matches!(
            self,
            JoinError::Cancelled
                | JoinError::Detached
                | JoinError::AlreadyJoined
                | JoinError::NoDispatcher
                | JoinError::AlreadyLaunched
        )
    }

    /// Consume the error, returning the panic payload.
    ///
    /// # Panics
    ///
    /// Panics if the error is not [`JoinError::Panicked`]; check with
    /// [`JoinError::is_panic`] first.
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        match self {
            JoinError::Panicked(payload) => payload.0,
            other => panic!("`JoinError::into_panic` on {other:?}"),
        }
    }
}
