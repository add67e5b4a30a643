//! Core value types shared by every part of a dispatch group.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unit of intent submitted to a dispatch group.
///
/// Auto-implemented for every `Clone + Send + Sync + 'static` type. Actions
/// are cloned once per engine on the broadcast path and echoed back in the
/// [`Reply`](crate::Reply) on the request/response path.
pub trait Action: Clone + Send + Sync + 'static {}

impl<T> Action for T where T: Clone + Send + Sync + 'static {}

/// The authoritative application snapshot.
///
/// State is never mutated in place: every committed value is held behind an
/// `Arc` and replaced wholesale.
pub trait State: Send + Sync + 'static {}

impl<T> State for T where T: Send + Sync + 'static {}

/// Fire-and-forget notification correlated with a transition.
pub trait SideEffect: Clone + Send + Sync + 'static {}

impl<T> SideEffect for T where T: Clone + Send + Sync + 'static {}

/// Outcome of one transition function invocation.
///
/// A `Mutation` always replaces the current state and bumps its version,
/// even when the new value equals the old one. A `NoMutation` never touches
/// the state.
#[derive(Debug, PartialEq)]
pub enum TransitionResult<S, E> {
    Mutation {
        state: Arc<S>,
        side_effect: Option<E>,
    },
    NoMutation {
        side_effect: Option<E>,
    },
}

impl<S, E: Clone> Clone for TransitionResult<S, E> {
    fn clone(&self) -> Self {
        match self {
            Self::Mutation { state, side_effect } => Self::Mutation {
                state: Arc::clone(state),
                side_effect: side_effect.clone(),
            },
            Self::NoMutation { side_effect } => Self::NoMutation {
                side_effect: side_effect.clone(),
            },
        }
    }
}

impl<S, E> TransitionResult<S, E> {
    /// Replace the state, no side effect.
    pub fn mutation(state: S) -> Self {
        Self::Mutation {
            state: Arc::new(state),
            side_effect: None,
        }
    }

    /// Replace the state and emit a side effect.
    pub fn mutation_with(state: S, side_effect: E) -> Self {
        Self::Mutation {
            state: Arc::new(state),
            side_effect: Some(side_effect),
        }
    }

    /// Leave the state alone and emit nothing.
    pub fn no_mutation() -> Self {
        Self::NoMutation { side_effect: None }
    }

    /// Leave the state alone but emit a side effect.
    pub fn side_effect_only(side_effect: E) -> Self {
        Self::NoMutation {
            side_effect: Some(side_effect),
        }
    }

    /// Attach (or replace) the side effect carried by this result.
    #[must_use]
    pub fn with_side_effect(self, effect: E) -> Self {
        match self {
            Self::Mutation { state, .. } => Self::Mutation {
                state,
                side_effect: Some(effect),
            },
            Self::NoMutation { .. } => Self::NoMutation {
                side_effect: Some(effect),
            },
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Mutation { .. })
    }

    /// The new state, if this is a `Mutation`.
    pub fn state(&self) -> Option<&Arc<S>> {
        match self {
            Self::Mutation { state, .. } => Some(state),
            Self::NoMutation { .. } => None,
        }
    }

    pub fn side_effect(&self) -> Option<&E> {
        match self {
            Self::Mutation { side_effect, .. } | Self::NoMutation { side_effect } => {
                side_effect.as_ref()
            }
        }
    }
}

/// A committed state value together with its version.
///
/// Version 0 is the initial state supplied at construction; every
/// `Mutation` increments it by one.
#[derive(Debug)]
pub struct Snapshot<S> {
    pub version: u64,
    pub state: Arc<S>,
}

impl<S> Clone for Snapshot<S> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            state: Arc::clone(&self.state),
        }
    }
}

impl<S> Snapshot<S> {
    /// Borrow the state value.
    pub fn value(&self) -> &S {
        &self.state
    }

    /// True when both snapshots point at the very same committed value.
    pub fn same_commit(&self, other: &Snapshot<S>) -> bool {
        self.version == other.version && Arc::ptr_eq(&self.state, &other.state)
    }
}

/// Correlates one `submit_and_await` call with the transition it triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Index of an engine within its group, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EngineId(pub usize);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// Identity of a dispatch group, used to detect reentrant awaits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GroupId(Uuid);

impl GroupId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Which ingress path delivered an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "request_id")]
pub enum Ingress {
    Broadcast,
    Request(RequestId),
}

impl fmt::Display for Ingress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ingress::Broadcast => f.write_str("broadcast"),
            Ingress::Request(id) => write!(f, "request {id}"),
        }
    }
}
