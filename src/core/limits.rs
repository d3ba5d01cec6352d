//! Operational limits. One struct, serde-defaulted, threaded everywhere.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Optimistic-commit retries before a batch fails with Conflict.
    pub commit_retry_budget: u32,
    /// Ops accepted in one changeset.
    pub max_ops_per_changeset: usize,
    /// Inverse changesets retained per itinerary for undo.
    pub undo_history_per_itinerary: usize,
    /// Live subscriptions allowed per itinerary.
    pub max_subscribers_per_itinerary: usize,
    /// Events queued per subscriber before drop-oldest kicks in.
    pub subscriber_queue_events: usize,
    /// Client reconnect schedule: base delay, cap, attempt budget.
    pub stream_backoff_base_ms: u64,
    pub stream_backoff_max_ms: u64,
    pub stream_max_attempts: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            commit_retry_budget: 3,
            max_ops_per_changeset: 256,
            undo_history_per_itinerary: 64,
            max_subscribers_per_itinerary: 32,
            subscriber_queue_events: 128,
            stream_backoff_base_ms: 250,
            stream_backoff_max_ms: 5_000,
            stream_max_attempts: 4,
        }
    }
}
