//! Publish/subscribe channel for transient notifications.
//!
//! Backed by a `tokio::sync::broadcast` ring: emitting never blocks, a slow
//! subscriber loses its oldest buffered items, and a notification emitted
//! while nobody listens is simply dropped.

use std::sync::{Mutex, PoisonError};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};

/// Stream of notifications handed to observers.
pub type NotificationStream<T> = BoxStream<'static, T>;

/// Fan-out channel with no replay of past notifications.
///
/// Used for side effects and for transition failure reports.
pub struct SideEffectNotifier<T> {
    tx: Mutex<Option<broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> SideEffectNotifier<T> {
    /// `buffer` bounds how far a subscriber may fall behind before it starts
    /// losing notifications.
    pub(crate) fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub(crate) fn emit(&self, item: T) -> usize {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.send(item).unwrap_or(0),
            None => 0,
        }
    }

    /// Notifications emitted from now on. Ends when the scope shuts down.
    pub fn subscribe(&self) -> NotificationStream<T> {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => receiver_stream(tx.subscribe()),
            None => stream::empty().boxed(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    pub(crate) fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

fn receiver_stream<T: Clone + Send + 'static>(rx: broadcast::Receiver<T>) -> NotificationStream<T> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notification subscriber lagged, oldest items dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
