//! Streamed event wire schema.
//!
//! Every event a subscriber sees carries the itinerary id, the version the
//! graph moved to, and a kind so clients can tell progress chatter from
//! patches that warrant a re-fetch.

use serde::{Deserialize, Serialize};

use super::change::{ChangeOp, RejectedOp};
use super::identity::{BatchId, ItineraryId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Informational only; the graph did not change.
    Progress,
    /// The graph changed; payload describes the applied batch.
    GraphPatch,
}

/// Payload of a `GraphPatch` event: one batch, ops in applied order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchPayload {
    pub batch_id: BatchId,
    pub applied: Vec<ChangeOp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub itinerary_id: ItineraryId,
    pub version: u64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

impl StreamEvent {
    pub fn patch(
        itinerary_id: ItineraryId,
        version: u64,
        payload: &PatchPayload,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            itinerary_id,
            version,
            kind: EventKind::GraphPatch,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn progress(
        itinerary_id: ItineraryId,
        version: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            itinerary_id,
            version,
            kind: EventKind::Progress,
            payload: serde_json::Value::String(message.into()),
        }
    }
}
