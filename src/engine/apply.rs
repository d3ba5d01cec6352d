//! The change engine: validate, stage, commit, undo.
//!
//! A changeset is applied all-or-partial: each operation is validated
//! against the working copy in submission order, failures are recorded and
//! skipped, and whatever passed is committed in one optimistic swap. Undo
//! replays a recorded inverse changeset through the exact same pipeline.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::{
    ApplyResult, BatchId, ChangeOp, ChangeSet, CoreError, Edge, Itinerary, ItineraryId, Limits,
    NodePatch, Patch, PatchPayload, RejectReason, RejectedOp, StreamEvent,
};
use crate::daemon::broadcast::EventBus;
use crate::daemon::metrics;
use crate::engine::resolver::EdgeResolver;
use crate::engine::store::{GraphStore, StoreError};
use crate::error::{Effect, Transience};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// Optimistic commit lost the race more times than the budget allows.
    #[error("conflict on {id}: retry budget exhausted after {attempts} attempts")]
    Conflict { id: ItineraryId, attempts: u32 },

    /// Strict owner policy: a batch touching the owner is rejected whole.
    #[error("owner identity is immutable; batch rejected")]
    OwnerImmutable,

    #[error("no recorded batch {batch_id} for {id}")]
    UnknownBatch {
        id: ItineraryId,
        batch_id: BatchId,
    },

    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("undo ledger lock poisoned")]
    LockPoisoned,
}

impl EngineError {
    pub fn transience(&self) -> Transience {
        match self {
            EngineError::Conflict { .. } => Transience::Retryable,
            EngineError::Store(e) => e.transience(),
            EngineError::LockPoisoned => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            EngineError::Store(e) => e.effect(),
            // The batch either committed and then failed to encode its
            // event (not reachable in practice) or touched nothing.
            EngineError::Encode(_) => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

struct UndoEntry {
    batch_id: BatchId,
    inverse: ChangeSet,
}

/// Outcome of staging one changeset against a working copy.
struct Staged {
    working: Itinerary,
    applied: Vec<ChangeOp>,
    inverse: ChangeSet,
    rejected: Vec<RejectedOp>,
}

pub struct ChangeEngine {
    store: Arc<GraphStore>,
    bus: Arc<EventBus>,
    resolver: EdgeResolver,
    limits: Limits,
    undo: Mutex<HashMap<ItineraryId, VecDeque<UndoEntry>>>,
}

impl ChangeEngine {
    pub fn new(
        store: Arc<GraphStore>,
        bus: Arc<EventBus>,
        resolver: EdgeResolver,
        limits: Limits,
    ) -> Self {
        Self {
            store,
            bus,
            resolver,
            limits,
            undo: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    /// Apply a changeset. Per-op failures land in `rejected` and never
    /// abort siblings; version conflicts are retried up to the budget.
    pub fn apply(
        &self,
        id: &ItineraryId,
        change_set: ChangeSet,
    ) -> Result<ApplyResult, EngineError> {
        let started = Instant::now();
        let result = self.apply_pipeline(id, change_set);
        match &result {
            Ok(outcome) => {
                metrics::apply_ok(started.elapsed());
                info!(
                    itinerary = %id,
                    batch = %outcome.batch_id,
                    applied = outcome.applied_count,
                    rejected = outcome.rejected.len(),
                    version = outcome.new_version,
                    "changeset applied"
                );
            }
            Err(err) => {
                metrics::apply_err(started.elapsed());
                warn!(itinerary = %id, error = %err, "changeset failed");
            }
        }
        result
    }

    /// Replay the recorded inverse of a previously applied batch through the
    /// full apply pipeline. The undo itself is recorded, so redo is just
    /// another undo.
    pub fn undo(&self, id: &ItineraryId, batch_id: BatchId) -> Result<ApplyResult, EngineError> {
        let entry = {
            let mut ledger = self.lock_undo()?;
            let entries = ledger.get_mut(id).ok_or_else(|| EngineError::UnknownBatch {
                id: id.clone(),
                batch_id,
            })?;
            let idx = entries
                .iter()
                .position(|e| e.batch_id == batch_id)
                .ok_or_else(|| EngineError::UnknownBatch {
                    id: id.clone(),
                    batch_id,
                })?;
            entries.remove(idx)
        };
        let Some(entry) = entry else {
            return Err(EngineError::UnknownBatch {
                id: id.clone(),
                batch_id,
            });
        };

        debug!(itinerary = %id, batch = %batch_id, ops = entry.inverse.len(), "undoing batch");
        let result = self.apply(id, entry.inverse.clone());

        // A replay that changed nothing (every inverse op rejected) or
        // failed outright leaves the batch undoable: put the entry back so
        // a later undo can retry once the obstacle clears.
        let effective = matches!(&result, Ok(outcome) if outcome.applied_count > 0);
        if !effective {
            let mut ledger = self.lock_undo()?;
            ledger.entry(id.clone()).or_default().push_back(entry);
        }
        result
    }

    /// Number of undoable batches currently recorded for an itinerary.
    pub fn undo_depth(&self, id: &ItineraryId) -> usize {
        self.lock_undo()
            .map(|ledger| ledger.get(id).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    fn apply_pipeline(
        &self,
        id: &ItineraryId,
        change_set: ChangeSet,
    ) -> Result<ApplyResult, EngineError> {
        if change_set.len() > self.limits.max_ops_per_changeset {
            return Err(CoreError::OpsTooMany {
                max_ops: self.limits.max_ops_per_changeset,
                got_ops: change_set.len(),
            }
            .into());
        }
        // Strict policy: the whole write is rejected, not just the field.
        if change_set
            .ops
            .iter()
            .any(|op| matches!(op, ChangeOp::SetOwner { .. }))
        {
            return Err(EngineError::OwnerImmutable);
        }

        let budget = self.limits.commit_retry_budget;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let snapshot = self.store.get(id)?;
            let staged = self.stage(&snapshot, &change_set);

            if staged.applied.is_empty() {
                // Nothing passed validation; no commit, no version bump.
                return Ok(ApplyResult {
                    batch_id: BatchId::generate(),
                    applied_count: 0,
                    rejected: staged.rejected,
                    new_version: snapshot.version,
                });
            }

            let Staged {
                working,
                applied,
                inverse,
                rejected,
            } = staged;
            match self.store.commit(id, snapshot.version, working) {
                Ok(new_version) => {
                    let batch_id = BatchId::generate();
                    self.record_undo(id, batch_id, inverse)?;
                    self.publish_patch(id, new_version, batch_id, &applied, &rejected)?;
                    return Ok(ApplyResult {
                        batch_id,
                        applied_count: applied.len(),
                        rejected,
                        new_version,
                    });
                }
                Err(StoreError::VersionConflict { stored, .. }) if attempts <= budget => {
                    debug!(
                        itinerary = %id,
                        attempt = attempts,
                        stored_version = stored,
                        "commit raced, re-reading"
                    );
                    continue;
                }
                Err(StoreError::VersionConflict { .. }) => {
                    return Err(EngineError::Conflict {
                        id: id.clone(),
                        attempts,
                    });
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Validate each op against the working copy in submission order.
    /// Passing ops mutate the working copy and record their inverse;
    /// failing ops are collected and skipped.
    fn stage(&self, snapshot: &Itinerary, change_set: &ChangeSet) -> Staged {
        let mut working = snapshot.clone();
        let mut applied = Vec::new();
        let mut inverse_ops = Vec::new();
        let mut rejected = Vec::new();

        for op in &change_set.ops {
            match self.stage_op(&mut working, snapshot, op) {
                Ok(Some(inv)) => {
                    applied.push(op.clone());
                    inverse_ops.push(inv);
                }
                Ok(None) => {
                    // State-idempotent op (e.g. unlock of an unlocked
                    // node): applied, nothing to undo.
                    applied.push(op.clone());
                }
                Err(reason) => rejected.push(RejectedOp {
                    op: op.clone(),
                    reason,
                }),
            }
        }

        // Inverses replay newest-first to unwind in reverse order.
        inverse_ops.reverse();
        Staged {
            working,
            applied,
            inverse: ChangeSet::new(inverse_ops),
            rejected,
        }
    }

    fn stage_op(
        &self,
        working: &mut Itinerary,
        snapshot: &Itinerary,
        op: &ChangeOp,
    ) -> Result<Option<ChangeOp>, RejectReason> {
        // Lock check first: a locked node rejects everything aimed at it
        // except an explicit unlock.
        if let Some(node_id) = op.lock_target() {
            match working.find_node(node_id) {
                Some(node) if node.locked => {
                    return Err(RejectReason::Locked {
                        node: node_id.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    return Err(RejectReason::NotFound {
                        target: node_id.to_string(),
                    });
                }
            }
        }

        match op {
            ChangeOp::MoveNode {
                node,
                to_day,
                position,
            } => {
                let (from_day, from_idx) =
                    working
                        .position_of_node(node)
                        .ok_or_else(|| RejectReason::NotFound {
                            target: node.to_string(),
                        })?;
                if working.day(*to_day).is_none() {
                    return Err(RejectReason::NotFound {
                        target: format!("day {to_day}"),
                    });
                }

                let moved = working
                    .day_mut(from_day)
                    .map(|d| d.nodes.remove(from_idx))
                    .ok_or_else(|| RejectReason::NotFound {
                        target: node.to_string(),
                    })?;
                let dest = working.day_mut(*to_day).ok_or_else(|| {
                    RejectReason::NotFound {
                        target: format!("day {to_day}"),
                    }
                })?;
                let idx = position.unwrap_or(dest.nodes.len()).min(dest.nodes.len());
                dest.nodes.insert(idx, moved);

                Ok(Some(ChangeOp::MoveNode {
                    node: node.clone(),
                    to_day: from_day,
                    position: Some(from_idx),
                }))
            }

            ChangeOp::UpdateNode { node, patch } => {
                let current = working
                    .find_node_mut(node)
                    .ok_or_else(|| RejectReason::NotFound {
                        target: node.to_string(),
                    })?;

                let inverse = NodePatch {
                    title: match &patch.title {
                        Patch::Set(_) => Patch::Set(current.title.clone()),
                        // Clear on a required field is a no-op.
                        _ => Patch::Keep,
                    },
                    kind: match &patch.kind {
                        Patch::Set(_) => Patch::Set(current.kind),
                        _ => Patch::Keep,
                    },
                    booking_ref: patch
                        .booking_ref
                        .inverse_from(current.booking_ref.clone()),
                    start_minute: patch
                        .start_minute
                        .inverse_from(current.payload.start_minute),
                    duration_minutes: patch
                        .duration_minutes
                        .inverse_from(current.payload.duration_minutes),
                    cost_minor: patch.cost_minor.inverse_from(current.payload.cost_minor),
                };

                if let Patch::Set(title) = &patch.title {
                    current.title = title.clone();
                }
                if let Patch::Set(kind) = &patch.kind {
                    current.kind = *kind;
                }
                current.booking_ref = patch
                    .booking_ref
                    .clone()
                    .apply_to(current.booking_ref.take());
                current.payload.start_minute =
                    patch.start_minute.clone().apply_to(current.payload.start_minute);
                current.payload.duration_minutes = patch
                    .duration_minutes
                    .clone()
                    .apply_to(current.payload.duration_minutes);
                current.payload.cost_minor =
                    patch.cost_minor.clone().apply_to(current.payload.cost_minor);

                Ok(Some(ChangeOp::UpdateNode {
                    node: node.clone(),
                    patch: inverse,
                }))
            }

            ChangeOp::AddEdge {
                source,
                target,
                day,
                edge_kind,
            } => {
                for endpoint in [source, target] {
                    if working.find_node(endpoint).is_none() {
                        return Err(RejectReason::NotFound {
                            target: endpoint.to_string(),
                        });
                    }
                }
                // Day resolution reads the batch's snapshot: every edge op
                // in a changeset resolves against the graph as read, not
                // against earlier staged moves.
                let resolved = self
                    .resolver
                    .resolve_day(*day, source, target, snapshot)
                    .map_err(|u| RejectReason::UnresolvedDay {
                        source: u.source,
                        target: u.target,
                    })?;

                let edge = Edge {
                    source: source.clone(),
                    target: target.clone(),
                    day: resolved,
                    kind: *edge_kind,
                };
                working
                    .day_mut(resolved)
                    .ok_or_else(|| RejectReason::NotFound {
                        target: format!("day {resolved}"),
                    })?
                    .edges
                    .push(edge);

                Ok(Some(ChangeOp::RemoveEdge {
                    source: source.clone(),
                    target: target.clone(),
                    day: Some(resolved),
                    edge_kind: *edge_kind,
                }))
            }

            ChangeOp::RemoveEdge {
                source,
                target,
                day,
                edge_kind,
            } => {
                for endpoint in [source, target] {
                    if working.find_node(endpoint).is_none() {
                        return Err(RejectReason::NotFound {
                            target: endpoint.to_string(),
                        });
                    }
                }
                let resolved = self
                    .resolver
                    .resolve_day(*day, source, target, snapshot)
                    .map_err(|u| RejectReason::UnresolvedDay {
                        source: u.source,
                        target: u.target,
                    })?;

                let day_slot = working
                    .day_mut(resolved)
                    .ok_or_else(|| RejectReason::NotFound {
                        target: format!("day {resolved}"),
                    })?;
                let idx = day_slot
                    .edges
                    .iter()
                    .position(|e| {
                        &e.source == source && &e.target == target && e.kind == *edge_kind
                    })
                    .ok_or_else(|| RejectReason::NotFound {
                        target: format!("edge {source}->{target} on day {resolved}"),
                    })?;
                day_slot.edges.remove(idx);

                Ok(Some(ChangeOp::AddEdge {
                    source: source.clone(),
                    target: target.clone(),
                    day: Some(resolved),
                    edge_kind: *edge_kind,
                }))
            }

            ChangeOp::LockNode { node } => {
                // Lock check above already rejected locked nodes, so this
                // node is present and unlocked.
                let current = working
                    .find_node_mut(node)
                    .ok_or_else(|| RejectReason::NotFound {
                        target: node.to_string(),
                    })?;
                current.locked = true;
                Ok(Some(ChangeOp::UnlockNode { node: node.clone() }))
            }

            ChangeOp::UnlockNode { node } => {
                let current = working
                    .find_node_mut(node)
                    .ok_or_else(|| RejectReason::NotFound {
                        target: node.to_string(),
                    })?;
                if current.locked {
                    current.locked = false;
                    Ok(Some(ChangeOp::LockNode { node: node.clone() }))
                } else {
                    Ok(None)
                }
            }

            // Filtered out before staging; kept for exhaustiveness.
            ChangeOp::SetOwner { .. } => Err(RejectReason::NotFound {
                target: "owner".to_string(),
            }),
        }
    }

    fn record_undo(
        &self,
        id: &ItineraryId,
        batch_id: BatchId,
        inverse: ChangeSet,
    ) -> Result<(), EngineError> {
        let mut ledger = self.lock_undo()?;
        let entries = ledger.entry(id.clone()).or_default();
        entries.push_back(UndoEntry { batch_id, inverse });
        while entries.len() > self.limits.undo_history_per_itinerary {
            entries.pop_front();
        }
        Ok(())
    }

    fn publish_patch(
        &self,
        id: &ItineraryId,
        new_version: u64,
        batch_id: BatchId,
        applied: &[ChangeOp],
        rejected: &[RejectedOp],
    ) -> Result<(), EngineError> {
        let payload = PatchPayload {
            batch_id,
            applied: applied.to_vec(),
            rejected: rejected.to_vec(),
        };
        let event = StreamEvent::patch(id.clone(), new_version, &payload)?;
        self.bus.publish(id, event);
        Ok(())
    }

    fn lock_undo(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<ItineraryId, VecDeque<UndoEntry>>>, EngineError>
    {
        self.undo.lock().map_err(|_| EngineError::LockPoisoned)
    }
}
