#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    ApplyResult, BatchId, ChangeOp, ChangeSet, Day, DayNumber, Edge, EdgeKind, EventKind,
    Itinerary, ItineraryId, Limits, Node, NodeKind, NodePatch, NodeId, Patch, PatchPayload,
    RejectReason, RejectedOp, StreamEvent, SubjectId,
};
pub use crate::engine::{ChangeEngine, EdgeResolver, EndpointPreference, GraphStore};
