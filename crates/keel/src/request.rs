//! Request/response action channel.
//!
//! Callers never share a reply slot. Each `submit_and_await` registers its
//! own oneshot under a fresh [`RequestId`] before the request is handed to
//! the engines, and the engine that processes it resolves exactly that entry.
//!
//! A request also carries the number of broadcast actions emitted before it.
//! The engine holds the request back until its broadcast loop has caught up
//! to that count, so the two paths keep each producer's submission order.
//!
//! ```text
//! caller ──register(id)──► PendingRegistry (DashMap<id, oneshot>)
//!    │                            ▲
//!    └──send(PendingRequest)──►  mpsc (bounded) ──► engine ──resolve(id)
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::core::{EngineId, RequestId, TransitionResult};
use crate::error::DispatchError;

/// An action waiting in the request/response handoff.
#[derive(Debug, Clone)]
pub struct PendingRequest<A> {
    pub id: RequestId,
    pub action: A,
    /// Broadcast actions emitted before this request. The engine runs the
    /// request only after its broadcast loop has taken that many, so a
    /// producer's `submit` followed by `submit_and_await` is applied in that
    /// order.
    pub after_broadcasts: u64,
}

/// Completed envelope returned to a `submit_and_await` caller.
#[derive(Debug)]
pub struct Reply<A, S, E> {
    pub request_id: RequestId,
    /// The submitted action, echoed back.
    pub action: A,
    pub result: TransitionResult<S, E>,
    /// State version after the transition was applied. Unchanged for
    /// `NoMutation`.
    pub version: u64,
    /// Engine that ran the transition.
    pub engine: EngineId,
}

pub(crate) type ReplyResult<A, S, E> = Result<Reply<A, S, E>, DispatchError>;

/// Receiver shared by the request loops of every engine in a group. Whoever
/// takes the lock first gets the next request.
pub(crate) type SharedRequestReceiver<A> = Arc<Mutex<mpsc::Receiver<PendingRequest<A>>>>;

pub(crate) fn request_channel<A>(
    capacity: usize,
) -> (mpsc::Sender<PendingRequest<A>>, SharedRequestReceiver<A>) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, Arc::new(Mutex::new(rx)))
}

pub(crate) async fn recv_shared<A>(rx: &SharedRequestReceiver<A>) -> Option<PendingRequest<A>> {
    rx.lock().await.recv().await
}

/// Waiters keyed by request id.
pub(crate) struct PendingRegistry<A, S, E> {
    waiters: DashMap<RequestId, oneshot::Sender<ReplyResult<A, S, E>>>,
}

impl<A, S, E> PendingRegistry<A, S, E> {
    pub(crate) fn new() -> Self {
        Self {
            waiters: DashMap::new(),
        }
    }

    /// Register a waiter. Dropping the guard withdraws it, so a caller that
    /// gives up (timeout, cancelled future) leaves nothing behind.
    pub(crate) fn register(
        self: &Arc<Self>,
        id: RequestId,
    ) -> (oneshot::Receiver<ReplyResult<A, S, E>>, WaiterGuard<A, S, E>) {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        let guard = WaiterGuard {
            registry: Arc::clone(self),
            id,
        };
        (rx, guard)
    }

    /// Hand `outcome` to the waiter registered under `id`.
    ///
    /// Returns false when the waiter is gone.
    pub(crate) fn resolve(&self, id: RequestId, outcome: ReplyResult<A, S, E>) -> bool {
        match self.waiters.remove(&id) {
            Some((_, tx)) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

pub(crate) struct WaiterGuard<A, S, E> {
    registry: Arc<PendingRegistry<A, S, E>>,
    id: RequestId,
}

impl<A, S, E> Drop for WaiterGuard<A, S, E> {
    fn drop(&mut self) {
        self.registry.waiters.remove(&self.id);
    }
}
