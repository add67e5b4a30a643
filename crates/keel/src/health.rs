//! Liveness reporting for dispatch engines.
//!
//! Each engine publishes its status and counters through a `watch` channel,
//! and every failure is also broadcast as a [`TransitionFailure`] record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::core::{EngineId, Ingress};
use crate::notifier::SideEffectNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Running,
    /// Stopped after a failure under
    /// [`FailurePolicy::StopEngine`](crate::FailurePolicy::StopEngine).
    Stopped,
}

/// One failed transition invocation.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionFailure {
    pub engine: EngineId,
    pub ingress: Ingress,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of one engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub engine: EngineId,
    pub transition: String,
    pub status: EngineStatus,
    /// Successful transitions.
    pub transitions: u64,
    pub failures: u64,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub last_failure: Option<TransitionFailure>,
}

impl EngineHealth {
    fn new(engine: EngineId, transition: &str) -> Self {
        Self {
            engine,
            transition: transition.to_string(),
            status: EngineStatus::Running,
            transitions: 0,
            failures: 0,
            last_transition_at: None,
            last_failure: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == EngineStatus::Running
    }
}

/// Write side, owned by the engine.
pub(crate) struct HealthReporter {
    tx: watch::Sender<EngineHealth>,
    failures: Arc<SideEffectNotifier<TransitionFailure>>,
}

impl HealthReporter {
    pub(crate) fn new(
        engine: EngineId,
        transition: &str,
        failures: Arc<SideEffectNotifier<TransitionFailure>>,
    ) -> (Self, watch::Receiver<EngineHealth>) {
        let (tx, rx) = watch::channel(EngineHealth::new(engine, transition));
        (Self { tx, failures }, rx)
    }

    pub(crate) fn record_success(&self) {
        self.tx.send_modify(|health| {
            health.transitions += 1;
            health.last_transition_at = Some(Utc::now());
        });
    }

    pub(crate) fn record_failure(&self, failure: TransitionFailure) {
        self.tx.send_modify(|health| {
            health.failures += 1;
            health.last_failure = Some(failure.clone());
        });
        self.failures.emit(failure);
    }

    pub(crate) fn mark_stopped(&self) {
        self.tx.send_modify(|health| health.status = EngineStatus::Stopped);
    }
}
