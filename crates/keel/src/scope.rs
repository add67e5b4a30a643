//! The concurrency scope that owns every intake loop.
//!
//! A [`DispatchScope`] plays the role of the host's structured-concurrency
//! scope: dispatch groups spawn their loops into it, and tearing it down
//! (explicitly or by dropping it) cancels all of them at their next wait
//! point.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One-way latch shared between a scope and everything it spawned.
///
/// Once triggered it stays triggered. Waiting on it is cancel-safe.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once [`trigger`](Self::trigger) has been called.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of the intake loops of one or more dispatch groups.
///
/// Must be used from within a tokio runtime. Dropping the scope signals
/// shutdown but does not wait; call [`join`](Self::join) for that.
#[derive(Debug, Default)]
pub struct DispatchScope {
    signal: ShutdownSignal,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Ask every loop to stop. In-flight transitions run to completion;
    /// loops blocked waiting for the next action exit immediately.
    pub fn shutdown(&self) {
        if !self.signal.is_triggered() {
            tracing::debug!("dispatch scope shutting down");
        }
        self.signal.trigger();
    }

    pub fn is_shutdown(&self) -> bool {
        self.signal.is_triggered()
    }

    /// Wait for every task spawned so far to finish.
    pub async fn join(&self) {
        tracing::debug!(tasks = self.task_count(), "joining dispatch tasks");
        let handles = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    tracing::error!(error = %err, "dispatch task panicked");
                }
            }
        }
    }

    /// [`shutdown`](Self::shutdown) followed by [`join`](Self::join).
    pub async fn close(&self) {
        self.shutdown();
        self.join().await;
    }

    /// Cancel every task immediately, including in-flight transitions.
    pub fn abort(&self) {
        self.signal.trigger();
        for handle in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            handle.abort();
        }
    }

    pub(crate) fn task_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        self.signal.trigger();
    }
}
