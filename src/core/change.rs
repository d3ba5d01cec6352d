//! Change operations, changesets, and apply results.

use serde::{Deserialize, Serialize};

use super::graph::{EdgeKind, NodeKind};
use super::identity::{BatchId, DayNumber, NodeId, SubjectId};

/// Three-state field patch: set a new value, clear it, or leave it alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Patch<T> {
    Set(T),
    Clear,
    #[default]
    Keep,
}

impl<T> Patch<T> {
    /// Fold this patch over the current value, returning the new value.
    pub fn apply_to(self, current: Option<T>) -> Option<T> {
        match self {
            Patch::Set(value) => Some(value),
            Patch::Clear => None,
            Patch::Keep => current,
        }
    }

    /// The patch that restores `prior` when replayed over the patched value.
    pub fn inverse_from(&self, prior: Option<T>) -> Patch<T>
    where
        T: Clone,
    {
        match self {
            Patch::Keep => Patch::Keep,
            _ => match prior {
                Some(value) => Patch::Set(value),
                None => Patch::Clear,
            },
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }
}

/// Partial update of a node's mutable fields. Identity and day placement
/// are not patchable here; moving is its own operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodePatch {
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub title: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub kind: Patch<NodeKind>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub booking_ref: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub start_minute: Patch<u32>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub duration_minutes: Patch<u32>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub cost_minor: Patch<u64>,
}

/// One atomic instruction against the graph.
///
/// Edge operations may carry an explicit day or leave it to be derived from
/// an endpoint's day by the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeOp {
    MoveNode {
        node: NodeId,
        to_day: DayNumber,
        /// Insertion index within the target day; append when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
    },
    UpdateNode {
        node: NodeId,
        patch: NodePatch,
    },
    AddEdge {
        source: NodeId,
        target: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        day: Option<DayNumber>,
        edge_kind: EdgeKind,
    },
    RemoveEdge {
        source: NodeId,
        target: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        day: Option<DayNumber>,
        edge_kind: EdgeKind,
    },
    LockNode {
        node: NodeId,
    },
    UnlockNode {
        node: NodeId,
    },
    /// Always rejected at batch level: owner identity is immutable after
    /// first persist.
    SetOwner {
        owner: SubjectId,
    },
}

impl ChangeOp {
    /// The node this op targets for lock purposes. Edge ops target the
    /// edge, not its endpoints, so locked endpoints do not veto them.
    pub fn lock_target(&self) -> Option<&NodeId> {
        match self {
            ChangeOp::MoveNode { node, .. }
            | ChangeOp::UpdateNode { node, .. }
            | ChangeOp::LockNode { node } => Some(node),
            _ => None,
        }
    }
}

/// Ordered batch of operations submitted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChangeSet {
    pub ops: Vec<ChangeOp>,
}

impl ChangeSet {
    pub fn new(ops: Vec<ChangeOp>) -> Self {
        Self { ops }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Why a single operation was rejected. Sibling operations are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Target day or node does not exist.
    NotFound { target: String },
    /// Target node is locked and the op is not an unlock.
    Locked { node: NodeId },
    /// Edge day could not be determined; both endpoints named.
    UnresolvedDay { source: NodeId, target: NodeId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedOp {
    pub op: ChangeOp,
    #[serde(flatten)]
    pub reason: RejectReason,
}

/// Outcome of applying one changeset: which ops landed, which were turned
/// away and why, and the version the itinerary moved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub batch_id: BatchId,
    pub applied_count: usize,
    pub rejected: Vec<RejectedOp>,
    pub new_version: u64,
}
