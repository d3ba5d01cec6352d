use thiserror::Error;

use crate::error::{Effect, Transience};

/// Identifier parse failures, one variant per id family.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidId {
    #[error("invalid itinerary id {raw:?}: {reason}")]
    Itinerary { raw: String, reason: String },

    #[error("invalid node id {raw:?}: {reason}")]
    Node { raw: String, reason: String },

    #[error("invalid day number {raw}: {reason}")]
    Day { raw: u32, reason: String },

    #[error("invalid subject id {raw:?}: {reason}")]
    Subject { raw: String, reason: String },

    #[error("invalid batch id {raw:?}: {reason}")]
    Batch { raw: String, reason: String },
}

/// Errors from the pure domain layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("day {day} already exists in itinerary")]
    DuplicateDay { day: u32 },

    #[error("no day {day} in itinerary")]
    NoSuchDay { day: u32 },

    #[error("node {node} already exists in itinerary")]
    DuplicateNode { node: String },

    #[error("changeset exceeds max ops {max_ops} (got {got_ops})")]
    OpsTooMany { max_ops: usize, got_ops: usize },
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        // Domain validation never succeeds on retry with the same inputs.
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
