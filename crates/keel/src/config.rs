//! Tunables for a dispatch group.

use serde::{Deserialize, Serialize};

/// Default per-subscriber side effect ring size.
pub const DEFAULT_SIDE_EFFECT_BUFFER: usize = 64;

/// Default number of requests that may wait in the request/response handoff.
pub const DEFAULT_REQUEST_CAPACITY: usize = 64;

/// What an engine does after its transition function fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Report the failure, leave state untouched, keep processing.
    #[default]
    SkipAction,
    /// Report the failure and stop both intake loops of the engine.
    StopEngine,
}

/// Configuration for a dispatch group.
///
/// Deserializable so hosts can embed it in their own config files; every
/// field falls back to its default when absent.
///
/// ```
/// use keel_core::{DispatchConfig, FailurePolicy};
///
/// let config = DispatchConfig::default()
///     .side_effect_buffer(16)
///     .failure_policy(FailurePolicy::StopEngine);
/// assert_eq!(config.side_effect_buffer, 16);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Side effects buffered per subscriber before the oldest are dropped.
    pub side_effect_buffer: usize,
    /// Bounded handoff capacity of the request/response channel.
    pub request_capacity: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            side_effect_buffer: DEFAULT_SIDE_EFFECT_BUFFER,
            request_capacity: DEFAULT_REQUEST_CAPACITY,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn side_effect_buffer(mut self, size: usize) -> Self {
        self.side_effect_buffer = size;
        self
    }

    pub fn request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Clamp zero capacities to 1; tokio channels reject a zero size.
    pub(crate) fn normalized(mut self) -> Self {
        if self.side_effect_buffer == 0 {
            tracing::warn!("side_effect_buffer of 0 clamped to 1");
            self.side_effect_buffer = 1;
        }
        if self.request_capacity == 0 {
            tracing::warn!("request_capacity of 0 clamped to 1");
            self.request_capacity = 1;
        }
        self
    }
}
