//! The transition function seam.

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::{Action, SideEffect, State, TransitionResult};
use crate::dispatch::DispatchHandle;

/// Maps `(action, current state)` to a [`TransitionResult`].
///
/// Invocations on one engine never overlap: the engine holds its lock for the
/// whole call, so `state` is always the latest value committed by that
/// engine.
///
/// The `dispatch` handle may be used to [`submit`](DispatchHandle::submit)
/// follow-up actions; they are queued and processed after this call returns.
/// Calling [`submit_and_await`](DispatchHandle::submit_and_await) on the same
/// group from here fails with [`DispatchError::Reentrant`](crate::DispatchError::Reentrant).
///
/// Returning `Err` (or panicking) is a transition failure, handled according
/// to the group's [`FailurePolicy`](crate::FailurePolicy).
#[async_trait]
pub trait Transition: Send + Sync + 'static {
    type Action: Action;
    type State: State;
    type SideEffect: SideEffect;

    async fn transition(
        &self,
        action: Self::Action,
        state: Arc<Self::State>,
        dispatch: &DispatchHandle<Self::Action, Self::State, Self::SideEffect>,
    ) -> Result<TransitionResult<Self::State, Self::SideEffect>>;

    /// Label used in logs and health reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Type-erased transition, as stored by the group.
pub type SharedTransition<A, S, E> = Arc<dyn Transition<Action = A, State = S, SideEffect = E>>;

/// Adapter turning a synchronous closure into a [`Transition`].
///
/// ```
/// use keel_core::{from_fn, TransitionResult};
///
/// let counter = from_fn(|delta: i64, count: &i64, _dispatch| {
///     Ok(TransitionResult::<i64, ()>::mutation(count + delta))
/// })
/// .named("counter");
/// ```
pub struct FnTransition<F, A, S, E> {
    f: F,
    name: &'static str,
    _types: PhantomData<fn() -> (A, S, E)>,
}

pub fn from_fn<F, A, S, E>(f: F) -> FnTransition<F, A, S, E>
where
    F: Fn(A, &S, &DispatchHandle<A, S, E>) -> Result<TransitionResult<S, E>>
        + Send
        + Sync
        + 'static,
    A: Action,
    S: State,
    E: SideEffect,
{
    FnTransition {
        f,
        name: "fn_transition",
        _types: PhantomData,
    }
}

impl<F, A, S, E> FnTransition<F, A, S, E> {
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

#[async_trait]
impl<F, A, S, E> Transition for FnTransition<F, A, S, E>
where
    F: Fn(A, &S, &DispatchHandle<A, S, E>) -> Result<TransitionResult<S, E>>
        + Send
        + Sync
        + 'static,
    A: Action,
    S: State,
    E: SideEffect,
{
    type Action = A;
    type State = S;
    type SideEffect = E;

    async fn transition(
        &self,
        action: A,
        state: Arc<S>,
        dispatch: &DispatchHandle<A, S, E>,
    ) -> Result<TransitionResult<S, E>> {
        (self.f)(action, &state, dispatch)
    }

    fn name(&self) -> &str {
        self.name
    }
}
