//! Error types surfaced to producers.

use std::time::Duration;

use thiserror::Error;

/// Why a submission could not be completed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The owning [`DispatchScope`](crate::DispatchScope) was shut down
    /// before the action was processed.
    #[error("dispatch scope was shut down")]
    Cancelled,

    /// Every engine in the group stopped after a transition failure.
    #[error("all engines in the dispatch group have stopped")]
    Halted,

    /// The engine that picked up this action stopped after an earlier
    /// failure before it could run the transition.
    #[error("engine stopped before processing the action")]
    EngineStopped,

    /// `submit_and_await` was called from inside a transition running on the
    /// same group. Awaiting would deadlock against the engine lock.
    #[error("submit_and_await called from within a transition of the same group")]
    Reentrant,

    /// The transition processing this request returned an error or panicked.
    #[error("transition failed: {0}")]
    TransitionFailed(String),

    /// The caller-supplied deadline passed before a reply arrived.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

impl DispatchError {
    /// True for errors caused by the group going away rather than by the
    /// action itself.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, DispatchError::Cancelled | DispatchError::Halted)
    }
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
