//! # Keel
//!
//! A single-writer state core: many producers submit actions, one engine at
//! a time turns each action into a state transition, and observers watch the
//! resulting versioned state and side effects.
//!
//! ## Core Concepts
//!
//! - [`Action`] = intent (what a producer wants to happen)
//! - [`State`] = the authoritative snapshot, replaced wholesale, never mutated
//! - [`SideEffect`] = a fire-and-forget notification, not part of state
//! - [`Transition`] = `(action, state, dispatch) -> TransitionResult`
//!
//! The key principle: **one transition at a time per engine**. Every action,
//! whichever way it arrives, runs under the engine lock and sees the state
//! committed by the transition before it.
//!
//! ## Architecture
//!
//! ```text
//! Producers
//!     │
//!     ├─► submit() ────────────► ActionBus ──────────┐ (one queue per engine)
//!     │                                              ▼
//!     └─► submit_and_await() ──► request mpsc ──► DispatchEngine
//!              ▲                                     │ lock
//!              │                                     ▼
//!              │                              Transition::transition()
//!              │                                     │
//!              │         ┌───────────────────────────┼──────────────────┐
//!              │         ▼                           ▼                  ▼
//!              └── PendingRegistry            StateCell::replace   Notifier::emit
//!                  (reply by RequestId)              │                  │
//!                                                    ▼                  ▼
//!                                           StateObserver::states  ::side_effects
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Serialized transitions** - at most one transition per engine at a time
//! 2. **No cross-talk** - a `submit_and_await` reply always belongs to its caller
//! 3. **NoMutation is neutral** - no state replacement, no version bump
//! 4. **Mutation always commits** - no deduplication of equal values
//! 5. **State replays, side effects don't** - new state subscribers get the
//!    current snapshot first; side effect subscribers only see later emissions
//!
//! ## Guarantees
//!
//! - **Total order per engine**: state subscribers observe commits in the
//!   order they happened
//! - **Producer order across paths**: an action passed to `submit` is applied
//!   before a later `submit_and_await` from the same producer
//! - **Non-blocking emission**: a stalled side effect subscriber loses its
//!   oldest notifications instead of stalling the engine
//! - **Explicit failure**: a failing transition is reported through
//!   [`StateObserver::failures`] and [`StateObserver::health`], and the
//!   waiting caller gets [`DispatchError::TransitionFailed`]
//! - **Cancellation**: shutting down the [`DispatchScope`] ends every intake
//!   loop and fails every pending `submit_and_await` with
//!   [`DispatchError::Cancelled`]
//!
//! ## Example
//!
//! ```
//! use futures::StreamExt;
//! use keel_core::{from_fn, DispatchGroupBuilder, DispatchScope, TransitionResult};
//!
//! #[derive(Debug, Clone)]
//! enum CounterAction {
//!     Increment,
//!     Decrement,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let scope = DispatchScope::new();
//! let counter = from_fn(|action: CounterAction, count: &i64, _dispatch| {
//!     let next = match action {
//!         CounterAction::Increment => count + 1,
//!         CounterAction::Decrement => count - 1,
//!     };
//!     Ok(TransitionResult::<i64, String>::mutation(next))
//! });
//!
//! let (dispatch, observer) = DispatchGroupBuilder::new(0i64, counter).build(&scope);
//!
//! let states = observer.states();
//! dispatch.submit(CounterAction::Increment)?;
//! let reply = dispatch.submit_and_await(CounterAction::Decrement).await?;
//! assert_eq!(reply.result.state().map(|s| **s), Some(0));
//! assert_eq!(reply.version, 2);
//!
//! let seen: Vec<i64> = states.take(3).map(|snapshot| *snapshot.value()).collect().await;
//! assert_eq!(seen, vec![0, 1, 0]);
//!
//! scope.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## What This Is Not
//!
//! Keel is **not**:
//! - Persistent (state lives in memory for the lifetime of the scope)
//! - Distributed
//! - An undo/replay log
//! - A payload validator (that is the transition's job)

// Core modules
mod bus;
mod config;
mod core;
mod dispatch;
mod engine;
mod error;
mod group;
mod health;
mod notifier;
mod request;
mod scope;
mod state;
mod transition;


// Re-export core types
pub use crate::core::{
    Action, EngineId, Ingress, RequestId, SideEffect, Snapshot, State, TransitionResult,
};

// Re-export error types
pub use crate::error::{DispatchError, Result};

// Re-export configuration
pub use config::{
    DispatchConfig, FailurePolicy, DEFAULT_REQUEST_CAPACITY, DEFAULT_SIDE_EFFECT_BUFFER,
};

// Re-export transition types
pub use transition::{from_fn, FnTransition, SharedTransition, Transition};

// Re-export dispatch types
pub use dispatch::DispatchHandle;
pub use request::{PendingRequest, Reply};

// Re-export observation types
pub use health::{EngineHealth, EngineStatus, TransitionFailure};
pub use notifier::{NotificationStream, SideEffectNotifier};
pub use state::{StateCell, StateStream};

// Re-export wiring (primary entry point)
pub use group::{create_dispatch_group, DispatchGroupBuilder, StateObserver};
pub use scope::{DispatchScope, ShutdownSignal};

// Re-export commonly used external types
pub use async_trait::async_trait;
