//! The shared state cell.
//!
//! Holds the current committed [`Snapshot`] and fans every replacement out
//! to subscribers while still holding the cell lock, so all subscribers see
//! replacements in the same total order.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::core::{Snapshot, State};

/// Versioned holder of the current state.
///
/// Readable by anyone; only dispatch engines replace it.
pub struct StateCell<S> {
    inner: Mutex<CellInner<S>>,
}

struct CellInner<S> {
    current: Snapshot<S>,
    subscribers: Vec<mpsc::UnboundedSender<Snapshot<S>>>,
    closed: bool,
}

impl<S: State> StateCell<S> {
    pub(crate) fn new(initial: S) -> Self {
        Self {
            inner: Mutex::new(CellInner {
                current: Snapshot {
                    version: 0,
                    state: Arc::new(initial),
                },
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CellInner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The latest committed snapshot. Never blocks on a transition.
    pub fn read(&self) -> Snapshot<S> {
        self.lock().current.clone()
    }

    /// Commit a new state, bump the version and notify subscribers.
    ///
    /// No deduplication: an equal value still produces a new version.
    pub(crate) fn replace(&self, state: Arc<S>) -> Snapshot<S> {
        let mut inner = self.lock();
        let next = Snapshot {
            version: inner.current.version + 1,
            state,
        };
        inner.current = next.clone();
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(next.clone()).is_ok());
        next
    }

    /// Stream of snapshots: the current one first, then every replacement in
    /// commit order.
    ///
    /// The stream ends when the owning scope shuts down. Each call starts an
    /// independent subscription.
    pub fn subscribe(&self) -> StateStream<S> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        // Receiver is alive, so this cannot fail.
        let _ = tx.send(inner.current.clone());
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        StateStream { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|subscriber| !subscriber.is_closed());
        inner.subscribers.len()
    }

    /// Terminate all subscriptions. Later subscribers receive the current
    /// snapshot and then end.
    pub(crate) fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }
}

/// Subscription returned by [`StateCell::subscribe`].
#[derive(Debug)]
pub struct StateStream<S> {
    rx: mpsc::UnboundedReceiver<Snapshot<S>>,
}

impl<S> Stream for StateStream<S> {
    type Item = Snapshot<S>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
