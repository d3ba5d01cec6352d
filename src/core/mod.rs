//! Pure domain layer: identities, the itinerary graph, change operations,
//! streamed event schemas, and operational limits. No IO here.

pub mod change;
pub mod error;
pub mod event;
pub mod graph;
pub mod identity;
pub mod limits;

pub use change::{
    ApplyResult, ChangeOp, ChangeSet, NodePatch, Patch, RejectReason, RejectedOp,
};
pub use error::{CoreError, InvalidId};
pub use event::{EventKind, PatchPayload, StreamEvent};
pub use graph::{Day, Edge, EdgeKind, Itinerary, Node, NodeKind, NodePayload};
pub use identity::{BatchId, DayNumber, ItineraryId, NodeId, SubjectId};
pub use limits::Limits;
