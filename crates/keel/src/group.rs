//! Wiring: builds a dispatch group and hands out its two faces.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::bus::ActionBus;
use crate::config::DispatchConfig;
use crate::core::{Action, EngineId, GroupId, SideEffect, Snapshot, State};
use crate::dispatch::{DispatchHandle, HandleInner};
use crate::engine::{DispatchEngine, Liveness};
use crate::health::{EngineHealth, HealthReporter, TransitionFailure};
use crate::notifier::{NotificationStream, SideEffectNotifier};
use crate::request::{request_channel, PendingRegistry};
use crate::scope::{DispatchScope, ShutdownSignal};
use crate::state::{StateCell, StateStream};
use crate::transition::{SharedTransition, Transition};

/// Builder for a dispatch group.
///
/// A group is one [`StateCell`], one side effect notifier, one broadcast
/// channel, one request/response channel, and one engine per registered
/// transition. At least one transition is required, so it is taken up front.
///
/// Engines registered on the same group share the state but not a lock:
/// transitions of different engines may interleave. Compose them into a
/// single transition when they must be serialized against each other.
pub struct DispatchGroupBuilder<A, S, E> {
    initial_state: S,
    transitions: Vec<SharedTransition<A, S, E>>,
    config: DispatchConfig,
}

impl<A: Action, S: State, E: SideEffect> DispatchGroupBuilder<A, S, E> {
    pub fn new<T>(initial_state: S, transition: T) -> Self
    where
        T: Transition<Action = A, State = S, SideEffect = E>,
    {
        Self {
            initial_state,
            transitions: vec![Arc::new(transition)],
            config: DispatchConfig::default(),
        }
    }

    /// Register another transition, run by its own engine.
    pub fn with_transition<T>(mut self, transition: T) -> Self
    where
        T: Transition<Action = A, State = S, SideEffect = E>,
    {
        self.transitions.push(Arc::new(transition));
        self
    }

    pub fn with_shared_transition(mut self, transition: SharedTransition<A, S, E>) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Allocate the group and start every engine's intake loops in `scope`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self, scope: &DispatchScope) -> (DispatchHandle<A, S, E>, StateObserver<S, E>) {
        let config = self.config.normalized();
        let group = GroupId::new();
        let engine_count = self.transitions.len();

        let cell = Arc::new(StateCell::new(self.initial_state));
        let notifier = Arc::new(SideEffectNotifier::new(config.side_effect_buffer));
        let failures = Arc::new(SideEffectNotifier::new(config.side_effect_buffer));
        let bus = Arc::new(ActionBus::new());
        let (request_tx, request_rx) = request_channel(config.request_capacity);
        let pending = Arc::new(PendingRegistry::new());
        let halted = ShutdownSignal::new();
        let liveness = Arc::new(Liveness::new(engine_count, halted.clone()));

        let handle = DispatchHandle::new(HandleInner {
            group,
            bus: Arc::clone(&bus),
            requests: request_tx,
            pending: Arc::clone(&pending),
            cell: Arc::clone(&cell),
            scope: scope.signal(),
            halted,
        });

        let mut health = Vec::with_capacity(engine_count);
        for (index, transition) in self.transitions.into_iter().enumerate() {
            let id = EngineId(index);
            let (reporter, health_rx) =
                HealthReporter::new(id, transition.name(), Arc::clone(&failures));
            health.push(health_rx);

            let engine = Arc::new(DispatchEngine {
                id,
                group,
                transition,
                lock: Mutex::new(()),
                handle: handle.clone(),
                cell: Arc::clone(&cell),
                notifier: Arc::clone(&notifier),
                pending: Arc::clone(&pending),
                health: reporter,
                policy: config.failure_policy,
                scope: scope.signal(),
                stopped: ShutdownSignal::new(),
                stop_reported: AtomicBool::new(false),
                liveness: Arc::clone(&liveness),
                broadcasts_done: watch::channel(0).0,
            });
            // Subscribe before returning the handle so no action is missed.
            engine.start(scope, bus.subscribe(), Arc::clone(&request_rx));
        }

        let signal = scope.signal();
        {
            let (cell, notifier, failures) =
                (Arc::clone(&cell), Arc::clone(&notifier), Arc::clone(&failures));
            scope.spawn(async move {
                signal.triggered().await;
                bus.close();
                cell.close();
                notifier.close();
                failures.close();
            });
        }

        tracing::info!(engines = engine_count, ?config, "dispatch group started");

        let observer = StateObserver {
            cell,
            notifier,
            failures,
            health,
        };
        (handle, observer)
    }
}

/// Build a group from an initial state, one required transition and any
/// number of additional ones.
pub fn create_dispatch_group<T, I>(
    scope: &DispatchScope,
    initial_state: T::State,
    transition: T,
    more: I,
) -> (
    DispatchHandle<T::Action, T::State, T::SideEffect>,
    StateObserver<T::State, T::SideEffect>,
)
where
    T: Transition,
    I: IntoIterator<Item = SharedTransition<T::Action, T::State, T::SideEffect>>,
{
    more.into_iter()
        .fold(
            DispatchGroupBuilder::new(initial_state, transition),
            DispatchGroupBuilder::with_shared_transition,
        )
        .build(scope)
}

/// Read-only view of a group: state, side effects and engine health.
pub struct StateObserver<S, E> {
    cell: Arc<StateCell<S>>,
    notifier: Arc<SideEffectNotifier<E>>,
    failures: Arc<SideEffectNotifier<TransitionFailure>>,
    health: Vec<watch::Receiver<EngineHealth>>,
}

impl<S, E> Clone for StateObserver<S, E> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            notifier: Arc::clone(&self.notifier),
            failures: Arc::clone(&self.failures),
            health: self.health.clone(),
        }
    }
}

impl<S: State, E: SideEffect> StateObserver<S, E> {
    /// Latest committed snapshot.
    pub fn state(&self) -> Snapshot<S> {
        self.cell.read()
    }

    /// Current snapshot first, then every committed replacement.
    pub fn states(&self) -> StateStream<S> {
        self.cell.subscribe()
    }

    /// Side effects emitted after this call.
    pub fn side_effects(&self) -> NotificationStream<E> {
        self.notifier.subscribe()
    }

    /// Transition failures reported after this call.
    pub fn failures(&self) -> NotificationStream<TransitionFailure> {
        self.failures.subscribe()
    }

    /// Health of every engine, in registration order.
    pub fn health(&self) -> Vec<EngineHealth> {
        self.health.iter().map(|rx| rx.borrow().clone()).collect()
    }

    /// Wait until `engine`'s health satisfies `predicate`.
    ///
    /// Returns `None` for an unknown engine or once the engine is gone.
    pub async fn wait_for_health<F>(
        &self,
        engine: EngineId,
        mut predicate: F,
    ) -> Option<EngineHealth>
    where
        F: FnMut(&EngineHealth) -> bool,
    {
        let mut rx = self.health.get(engine.0)?.clone();
        let health = rx.wait_for(|health| predicate(health)).await.ok()?;
        Some(EngineHealth::clone(&health))
    }
}
