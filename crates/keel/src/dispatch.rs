//! The producer-facing dispatch handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::bus::ActionBus;
use crate::core::{Action, GroupId, RequestId, SideEffect, Snapshot, State};
use crate::error::{DispatchError, Result};
use crate::request::{PendingRegistry, PendingRequest, Reply};
use crate::scope::ShutdownSignal;
use crate::state::StateCell;

tokio::task_local! {
    /// Set while a transition of the given group is executing on this task.
    pub(crate) static ACTIVE_GROUP: GroupId;
}

/// Submits actions to a dispatch group. Cheap to clone.
pub struct DispatchHandle<A, S, E> {
    inner: Arc<HandleInner<A, S, E>>,
}

pub(crate) struct HandleInner<A, S, E> {
    pub(crate) group: GroupId,
    pub(crate) bus: Arc<ActionBus<A>>,
    pub(crate) requests: mpsc::Sender<PendingRequest<A>>,
    pub(crate) pending: Arc<PendingRegistry<A, S, E>>,
    pub(crate) cell: Arc<StateCell<S>>,
    pub(crate) scope: ShutdownSignal,
    pub(crate) halted: ShutdownSignal,
}

impl<A, S, E> Clone for DispatchHandle<A, S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Action, S: State, E: SideEffect> DispatchHandle<A, S, E> {
    pub(crate) fn new(inner: HandleInner<A, S, E>) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.scope.is_triggered() {
            return Err(DispatchError::Cancelled);
        }
        if self.inner.halted.is_triggered() {
            return Err(DispatchError::Halted);
        }
        Ok(())
    }

    /// Fire-and-forget submission on the broadcast path.
    ///
    /// Never waits: the action is queued for every engine in the group and
    /// processed later. Safe to call from inside a transition.
    pub fn submit(&self, action: A) -> Result<()> {
        self.ensure_open()?;
        match self.inner.bus.emit(action) {
            Some(0) => Err(DispatchError::Halted),
            Some(_) => Ok(()),
            None => Err(DispatchError::Cancelled),
        }
    }

    /// Submit on the request/response path and wait for the transition it
    /// triggers.
    ///
    /// The reply always belongs to this call, and the transition runs after
    /// every action this producer already passed to [`submit`](Self::submit).
    /// Waits for a free slot in the bounded handoff first. Fails with
    /// [`DispatchError::Cancelled`] if the scope shuts down while waiting, and
    /// with [`DispatchError::Reentrant`] when called from a transition of
    /// this same group.
    pub async fn submit_and_await(&self, action: A) -> Result<Reply<A, S, E>> {
        let group = self.inner.group;
        if ACTIVE_GROUP.try_with(|active| *active == group).unwrap_or(false) {
            return Err(DispatchError::Reentrant);
        }
        self.ensure_open()?;

        let id = RequestId::new();
        let (reply, _guard) = self.inner.pending.register(id);
        let request = PendingRequest {
            id,
            action,
            after_broadcasts: self.inner.bus.emitted(),
        };

        tokio::select! {
            sent = self.inner.requests.send(request) => {
                if sent.is_err() {
                    return Err(DispatchError::Cancelled);
                }
            }
            _ = self.inner.scope.triggered() => return Err(DispatchError::Cancelled),
            _ = self.inner.halted.triggered() => return Err(DispatchError::Halted),
        }
        tracing::trace!(request_id = %id, "request handed off");

        tokio::select! {
            biased;
            outcome = reply => outcome.unwrap_or(Err(DispatchError::Cancelled)),
            _ = self.inner.scope.triggered() => Err(DispatchError::Cancelled),
            _ = self.inner.halted.triggered() => Err(DispatchError::Halted),
        }
    }

    /// [`submit_and_await`](Self::submit_and_await) with a deadline.
    ///
    /// On timeout the waiter is withdrawn; the action may still be processed
    /// later, its reply is discarded.
    pub async fn submit_and_await_timeout(
        &self,
        action: A,
        timeout: Duration,
    ) -> Result<Reply<A, S, E>> {
        tokio::time::timeout(timeout, self.submit_and_await(action))
            .await
            .map_err(|_| DispatchError::Timeout(timeout))?
    }

    /// Latest committed state, for producers deciding what to submit.
    pub fn current(&self) -> Snapshot<S> {
        self.inner.cell.read()
    }

    /// Requests currently waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.ensure_open().is_err()
    }
}
