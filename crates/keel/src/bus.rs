//! Broadcast action channel.
//!
//! Every subscriber (one per dispatch engine) gets its own unbounded queue,
//! so handing an action off never waits on an engine that is busy running a
//! transition. This is what lets a transition `submit` follow-up actions
//! while its engine holds the lock.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::core::Action;

/// Receiving end of one bus subscription.
pub(crate) type ActionReceiver<A> = mpsc::UnboundedReceiver<A>;

/// Multi-producer, multi-consumer fire-and-forget channel.
///
/// Per-producer order is preserved for each subscriber; actions from
/// different producers interleave in whatever order they were emitted.
pub(crate) struct ActionBus<A> {
    inner: Mutex<BusInner<A>>,
}

struct BusInner<A> {
    subscribers: Vec<mpsc::UnboundedSender<A>>,
    /// Actions accepted so far. Every live subscriber has been sent exactly
    /// this many.
    emitted: u64,
    closed: bool,
}

impl<A: Action> ActionBus<A> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                subscribers: Vec::new(),
                emitted: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner<A>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `action` to every live subscriber.
    ///
    /// Returns the number of subscribers reached, or `None` once closed.
    pub(crate) fn emit(&self, action: A) -> Option<usize> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(action.clone()).is_ok());
        let reached = inner.subscribers.len();
        if reached > 0 {
            inner.emitted += 1;
        }
        Some(reached)
    }

    /// Number of actions handed to the subscribers so far, including every
    /// action whose `emit` returned before this call.
    pub(crate) fn emitted(&self) -> u64 {
        self.lock().emitted
    }

    pub(crate) fn subscribe(&self) -> ActionReceiver<A> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        rx
    }

    pub(crate) fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }
}
