//! The dispatch engine: two intake loops, one lock.
//!
//! ```text
//!  ActionBus queue ──► broadcast loop ──┐
//!                                       ├─► lock ─► transition ─► apply ─► unlock
//!  request mpsc ─────► request loop ────┘                           │
//!                                                                   ├─► StateCell::replace
//!                                                                   ├─► SideEffectNotifier::emit
//!                                                                   └─► PendingRegistry::resolve
//! ```
//!
//! Both loops of an engine share one `tokio::sync::Mutex`, so at most one
//! transition runs per engine. Engines in the same group do not share a lock.
//!
//! The broadcast loop publishes how many actions it has finished. A request
//! stamped with `after_broadcasts = n` is held until that count reaches `n`,
//! so it never overtakes a broadcast its producer submitted earlier.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tracing::Instrument;

use crate::bus::ActionReceiver;
use crate::config::FailurePolicy;
use crate::core::{Action, EngineId, GroupId, Ingress, SideEffect, State, TransitionResult};
use crate::dispatch::{DispatchHandle, ACTIVE_GROUP};
use crate::error::DispatchError;
use crate::health::{HealthReporter, TransitionFailure};
use crate::notifier::SideEffectNotifier;
use crate::request::{recv_shared, PendingRegistry, PendingRequest, Reply, SharedRequestReceiver};
use crate::scope::{DispatchScope, ShutdownSignal};
use crate::state::StateCell;
use crate::transition::SharedTransition;

/// Counts running engines and halts the group when the last one stops.
pub(crate) struct Liveness {
    running: AtomicUsize,
    halted: ShutdownSignal,
}

impl Liveness {
    pub(crate) fn new(engines: usize, halted: ShutdownSignal) -> Self {
        Self {
            running: AtomicUsize::new(engines),
            halted,
        }
    }

    fn engine_stopped(&self) {
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::error!("every engine in the dispatch group has stopped");
            self.halted.trigger();
        }
    }
}

pub(crate) struct DispatchEngine<A, S, E> {
    pub(crate) id: EngineId,
    pub(crate) group: GroupId,
    pub(crate) transition: SharedTransition<A, S, E>,
    pub(crate) lock: Mutex<()>,
    pub(crate) handle: DispatchHandle<A, S, E>,
    pub(crate) cell: Arc<StateCell<S>>,
    pub(crate) notifier: Arc<SideEffectNotifier<E>>,
    pub(crate) pending: Arc<PendingRegistry<A, S, E>>,
    pub(crate) health: HealthReporter,
    pub(crate) policy: FailurePolicy,
    pub(crate) scope: ShutdownSignal,
    pub(crate) stopped: ShutdownSignal,
    pub(crate) stop_reported: AtomicBool,
    pub(crate) liveness: Arc<Liveness>,
    /// Broadcast actions finished by this engine, applied or failed.
    pub(crate) broadcasts_done: watch::Sender<u64>,
}

impl<A: Action, S: State, E: SideEffect> DispatchEngine<A, S, E> {
    /// Spawn both intake loops into `scope`.
    pub(crate) fn start(
        self: Arc<Self>,
        scope: &DispatchScope,
        actions: ActionReceiver<A>,
        requests: SharedRequestReceiver<A>,
    ) {
        let span = tracing::info_span!(
            "dispatch_engine",
            engine = %self.id,
            transition = self.transition.name(),
        );
        scope.spawn(Arc::clone(&self).broadcast_loop(actions).instrument(span.clone()));
        scope.spawn(self.request_loop(requests).instrument(span));
    }

    async fn broadcast_loop(self: Arc<Self>, mut actions: ActionReceiver<A>) {
        loop {
            let action = tokio::select! {
                biased;
                _ = self.scope.triggered() => break,
                _ = self.stopped.triggered() => break,
                next = actions.recv() => match next {
                    Some(action) => action,
                    None => break,
                },
            };

            // Failures are already reported; nobody waits on this path.
            let _ = self.run(action, Ingress::Broadcast).await;
            self.broadcasts_done.send_modify(|done| *done += 1);
            self.report_stop();
        }
        tracing::debug!("broadcast intake loop exited");
    }

    async fn request_loop(self: Arc<Self>, requests: SharedRequestReceiver<A>) {
        loop {
            let PendingRequest {
                id,
                action,
                after_broadcasts,
            } = tokio::select! {
                biased;
                _ = self.scope.triggered() => break,
                _ = self.stopped.triggered() => break,
                next = recv_shared(&requests) => match next {
                    Some(request) => request,
                    None => break,
                },
            };

            // A stopped engine falls through so `run` can answer the waiter.
            tokio::select! {
                biased;
                _ = self.scope.triggered() => break,
                _ = self.stopped.triggered() => {}
                _ = self.caught_up(after_broadcasts) => {}
            }

            let echo = action.clone();
            let outcome = self
                .run(action, Ingress::Request(id))
                .await
                .map(|(result, version)| Reply {
                    request_id: id,
                    action: echo,
                    result,
                    version,
                    engine: self.id,
                });
            if !self.pending.resolve(id, outcome) {
                tracing::debug!(request_id = %id, "waiter withdrew before the reply was ready");
            }
            // Only after the reply is out, so the failing caller sees the
            // failure rather than the group halting.
            self.report_stop();
        }
        tracing::debug!("request intake loop exited");
    }

    /// Resolve once the broadcast loop has finished `count` actions.
    async fn caught_up(&self, count: u64) {
        let mut done = self.broadcasts_done.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = done.wait_for(|done| *done >= count).await;
    }

    /// Run one transition under the engine lock and apply its result.
    async fn run(
        &self,
        action: A,
        ingress: Ingress,
    ) -> Result<(TransitionResult<S, E>, u64), DispatchError> {
        let _guard = self.lock.lock().await;
        // The other loop may have stopped the engine while we waited.
        if self.stopped.is_triggered() {
            tracing::debug!(%ingress, "dropping action, engine stopped");
            return Err(DispatchError::EngineStopped);
        }

        let current = self.cell.read();
        let invocation = self
            .transition
            .transition(action, Arc::clone(&current.state), &self.handle);
        let outcome = ACTIVE_GROUP
            .scope(self.group, AssertUnwindSafe(invocation).catch_unwind())
            .await;

        match outcome {
            Ok(Ok(result)) => {
                self.health.record_success();
                let version = self.apply(&result);
                tracing::trace!(
                    %ingress,
                    version,
                    mutated = result.is_mutation(),
                    "transition applied"
                );
                Ok((result, version))
            }
            Ok(Err(err)) => Err(self.fail(ingress, format!("{err:#}"))),
            Err(panic) => Err(self.fail(ingress, panic_message(panic.as_ref()))),
        }
    }

    fn apply(&self, result: &TransitionResult<S, E>) -> u64 {
        let version = match result.state() {
            Some(state) => self.cell.replace(Arc::clone(state)).version,
            None => self.cell.read().version,
        };
        if let Some(effect) = result.side_effect() {
            let delivered = self.notifier.emit(effect.clone());
            tracing::trace!(delivered, "side effect emitted");
        }
        version
    }

    fn fail(&self, ingress: Ingress, message: String) -> DispatchError {
        tracing::error!(%ingress, error = %message, "transition failed");
        self.health.record_failure(TransitionFailure {
            engine: self.id,
            ingress,
            message: message.clone(),
            at: Utc::now(),
        });

        if self.policy == FailurePolicy::StopEngine && !self.stopped.is_triggered() {
            tracing::warn!("stopping engine after transition failure");
            self.stopped.trigger();
            self.health.mark_stopped();
        }
        DispatchError::TransitionFailed(message)
    }

    /// Tell the group this engine has stopped, once.
    fn report_stop(&self) {
        if self.stopped.is_triggered() && !self.stop_reported.swap(true, Ordering::AcqRel) {
            self.liveness.engine_stopped();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
