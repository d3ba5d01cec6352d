//! Engine integration: staging, partial rejection, optimistic commit,
//! undo, and fan-out through the bus.

use std::sync::Arc;

use wayline::core::{
    ChangeOp, ChangeSet, Day, DayNumber, EdgeKind, EventKind, Itinerary, ItineraryId, Limits,
    Node, NodeId, NodeKind, NodePatch, Patch, PatchPayload, RejectReason,
};
use wayline::daemon::broadcast::EventBus;
use wayline::engine::apply::{ChangeEngine, EngineError};
use wayline::engine::resolver::{EdgeResolver, EndpointPreference};
use wayline::engine::store::GraphStore;
use wayline::SubjectId;

fn day(n: u32) -> DayNumber {
    DayNumber::new(n).unwrap()
}

fn node(id: &str) -> NodeId {
    NodeId::parse(id).unwrap()
}

/// Two-day trip: louvre and bistro on day 1, hotel on day 2.
fn seed(id: &str) -> Itinerary {
    let mut it = Itinerary::new(
        ItineraryId::parse(id).unwrap(),
        SubjectId::parse("alice").unwrap(),
    );
    it.add_day(Day::new(day(1))).unwrap();
    it.add_day(Day::new(day(2))).unwrap();
    it.add_node(day(1), Node::new(node("louvre"), NodeKind::Place, "Louvre"))
        .unwrap();
    it.add_node(day(1), Node::new(node("bistro"), NodeKind::Meal, "Bistro"))
        .unwrap();
    it.add_node(
        day(2),
        Node::new(node("hotel"), NodeKind::Lodging, "Hotel du Nord"),
    )
    .unwrap();
    it
}

fn harness(id: &str, limits: Limits) -> (Arc<ChangeEngine>, Arc<EventBus>, ItineraryId) {
    let store = Arc::new(GraphStore::in_memory());
    store.insert(seed(id)).unwrap();
    let bus = Arc::new(EventBus::new(
        limits.max_subscribers_per_itinerary,
        limits.subscriber_queue_events,
    ));
    let engine = Arc::new(ChangeEngine::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        EdgeResolver::new(EndpointPreference::Reject),
        limits,
    ));
    (engine, bus, ItineraryId::parse(id).unwrap())
}

#[test]
fn valid_changeset_applies_whole_and_bumps_version_once() {
    let (engine, _bus, id) = harness("t1", Limits::default());

    let result = engine
        .apply(
            &id,
            ChangeSet::new(vec![
                ChangeOp::MoveNode {
                    node: node("louvre"),
                    to_day: day(2),
                    position: None,
                },
                ChangeOp::UpdateNode {
                    node: node("bistro"),
                    patch: NodePatch {
                        title: Patch::Set("Le Bistro".into()),
                        start_minute: Patch::Set(720),
                        ..NodePatch::default()
                    },
                },
                ChangeOp::LockNode {
                    node: node("hotel"),
                },
            ]),
        )
        .unwrap();

    assert_eq!(result.applied_count, 3);
    assert!(result.rejected.is_empty());
    assert_eq!(result.new_version, 1);

    let snap = engine.store().get(&id).unwrap();
    assert_eq!(snap.version, 1);
    assert_eq!(snap.day_of_node(&node("louvre")), Some(day(2)));
    assert_eq!(snap.find_node(&node("bistro")).unwrap().title, "Le Bistro");
    assert!(snap.find_node(&node("hotel")).unwrap().locked);
}

#[test]
fn rejected_op_does_not_abort_siblings() {
    let (engine, _bus, id) = harness("t1", Limits::default());

    // louvre and hotel sit on different days and no day is given, so the
    // edge cannot be placed even though the move in the same batch would
    // have put them together.
    let result = engine
        .apply(
            &id,
            ChangeSet::new(vec![
                ChangeOp::MoveNode {
                    node: node("louvre"),
                    to_day: day(2),
                    position: None,
                },
                ChangeOp::AddEdge {
                    source: node("louvre"),
                    target: node("hotel"),
                    day: None,
                    edge_kind: EdgeKind::Travel,
                },
            ]),
        )
        .unwrap();

    assert_eq!(result.applied_count, 1);
    assert_eq!(result.new_version, 1);
    assert_eq!(result.rejected.len(), 1);
    assert_eq!(
        result.rejected[0].reason,
        RejectReason::UnresolvedDay {
            source: node("louvre"),
            target: node("hotel"),
        }
    );

    let snap = engine.store().get(&id).unwrap();
    assert_eq!(snap.day_of_node(&node("louvre")), Some(day(2)));
    assert!(snap.day(day(2)).unwrap().edges.is_empty());
}

#[test]
fn fully_rejected_changeset_leaves_version_unchanged() {
    let (engine, _bus, id) = harness("t1", Limits::default());

    let result = engine
        .apply(
            &id,
            ChangeSet::new(vec![ChangeOp::MoveNode {
                node: node("ghost"),
                to_day: day(2),
                position: None,
            }]),
        )
        .unwrap();

    assert_eq!(result.applied_count, 0);
    assert_eq!(result.new_version, 0);
    assert!(matches!(
        result.rejected[0].reason,
        RejectReason::NotFound { .. }
    ));
    assert_eq!(engine.store().get(&id).unwrap().version, 0);
    assert_eq!(engine.undo_depth(&id), 0);
}

#[test]
fn locked_node_rejects_everything_but_unlock() {
    let (engine, _bus, id) = harness("t1", Limits::default());

    engine
        .apply(
            &id,
            ChangeSet::new(vec![ChangeOp::LockNode {
                node: node("louvre"),
            }]),
        )
        .unwrap();

    let result = engine
        .apply(
            &id,
            ChangeSet::new(vec![
                ChangeOp::MoveNode {
                    node: node("louvre"),
                    to_day: day(2),
                    position: None,
                },
                ChangeOp::UpdateNode {
                    node: node("louvre"),
                    patch: NodePatch {
                        title: Patch::Set("nope".into()),
                        ..NodePatch::default()
                    },
                },
            ]),
        )
        .unwrap();
    assert_eq!(result.applied_count, 0);
    assert!(result
        .rejected
        .iter()
        .all(|r| r.reason == RejectReason::Locked {
            node: node("louvre")
        }));

    // Unlock goes through, then the move does too.
    let result = engine
        .apply(
            &id,
            ChangeSet::new(vec![
                ChangeOp::UnlockNode {
                    node: node("louvre"),
                },
                ChangeOp::MoveNode {
                    node: node("louvre"),
                    to_day: day(2),
                    position: None,
                },
            ]),
        )
        .unwrap();
    assert_eq!(result.applied_count, 2);
    assert!(result.rejected.is_empty());
}

#[test]
fn locked_endpoint_does_not_veto_edge_ops() {
    let (engine, _bus, id) = harness("t1", Limits::default());

    let result = engine
        .apply(
            &id,
            ChangeSet::new(vec![
                ChangeOp::LockNode {
                    node: node("louvre"),
                },
                ChangeOp::AddEdge {
                    source: node("louvre"),
                    target: node("bistro"),
                    day: None,
                    edge_kind: EdgeKind::Sequence,
                },
            ]),
        )
        .unwrap();

    assert_eq!(result.applied_count, 2);
    assert_eq!(
        engine.store().get(&id).unwrap().day(day(1)).unwrap().edges.len(),
        1
    );
}

#[test]
fn owner_change_rejects_the_whole_batch() {
    let (engine, _bus, id) = harness("t1", Limits::default());

    let err = engine
        .apply(
            &id,
            ChangeSet::new(vec![
                ChangeOp::LockNode {
                    node: node("louvre"),
                },
                ChangeOp::SetOwner {
                    owner: SubjectId::parse("mallory").unwrap(),
                },
            ]),
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::OwnerImmutable));

    // Nothing landed, not even the valid sibling.
    let snap = engine.store().get(&id).unwrap();
    assert_eq!(snap.version, 0);
    assert!(!snap.find_node(&node("louvre")).unwrap().locked);
}

#[test]
fn oversized_changeset_rejected_up_front() {
    let limits = Limits {
        max_ops_per_changeset: 2,
        ..Limits::default()
    };
    let (engine, _bus, id) = harness("t1", limits);

    let ops = vec![
        ChangeOp::LockNode {
            node: node("louvre")
        };
        3
    ];
    let err = engine.apply(&id, ChangeSet::new(ops)).unwrap_err();
    assert!(matches!(err, EngineError::Core(_)));
    assert_eq!(engine.store().get(&id).unwrap().version, 0);
}

#[test]
fn undo_restores_prior_content() {
    let (engine, _bus, id) = harness("t1", Limits::default());
    let before = (*engine.store().get(&id).unwrap()).clone();

    let applied = engine
        .apply(
            &id,
            ChangeSet::new(vec![
                ChangeOp::MoveNode {
                    node: node("louvre"),
                    to_day: day(2),
                    position: Some(0),
                },
                ChangeOp::UpdateNode {
                    node: node("bistro"),
                    patch: NodePatch {
                        title: Patch::Set("Renamed".into()),
                        booking_ref: Patch::Set("BK-42".into()),
                        cost_minor: Patch::Set(4500),
                        ..NodePatch::default()
                    },
                },
                ChangeOp::AddEdge {
                    source: node("louvre"),
                    target: node("bistro"),
                    day: None,
                    edge_kind: EdgeKind::Travel,
                },
            ]),
        )
        .unwrap();
    assert_eq!(applied.applied_count, 3);
    assert_eq!(engine.undo_depth(&id), 1);

    let undone = engine.undo(&id, applied.batch_id).unwrap();
    assert_eq!(undone.new_version, 2);
    assert!(undone.rejected.is_empty());

    let after = engine.store().get(&id).unwrap();
    assert!(after.same_content(&before));
    // The undo is itself undoable.
    assert_eq!(engine.undo_depth(&id), 1);
}

#[test]
fn undo_of_partial_batch_reverses_only_what_applied() {
    let (engine, _bus, id) = harness("t1", Limits::default());
    let before = (*engine.store().get(&id).unwrap()).clone();

    let applied = engine
        .apply(
            &id,
            ChangeSet::new(vec![
                ChangeOp::MoveNode {
                    node: node("bistro"),
                    to_day: day(2),
                    position: None,
                },
                ChangeOp::MoveNode {
                    node: node("ghost"),
                    to_day: day(2),
                    position: None,
                },
            ]),
        )
        .unwrap();
    assert_eq!(applied.applied_count, 1);
    assert_eq!(applied.rejected.len(), 1);

    let undone = engine.undo(&id, applied.batch_id).unwrap();
    assert!(undone.rejected.is_empty());
    assert!(engine.store().get(&id).unwrap().same_content(&before));
}

#[test]
fn ineffective_undo_keeps_the_batch_undoable() {
    let (engine, _bus, id) = harness("t1", Limits::default());

    let renamed = engine
        .apply(
            &id,
            ChangeSet::new(vec![ChangeOp::UpdateNode {
                node: node("louvre"),
                patch: NodePatch {
                    title: Patch::Set("Grand Louvre".into()),
                    ..NodePatch::default()
                },
            }]),
        )
        .unwrap();
    let locked = engine
        .apply(
            &id,
            ChangeSet::new(vec![ChangeOp::LockNode {
                node: node("louvre"),
            }]),
        )
        .unwrap();

    // The lock blocks the inverse update; nothing changes, but the batch
    // must stay in the ledger.
    let blocked = engine.undo(&id, renamed.batch_id).unwrap();
    assert_eq!(blocked.applied_count, 0);
    assert!(matches!(
        blocked.rejected[0].reason,
        RejectReason::Locked { .. }
    ));
    assert_eq!(engine.store().get(&id).unwrap().version, 2);

    // Clear the obstacle, then the retried undo restores the title.
    engine.undo(&id, locked.batch_id).unwrap();
    let retried = engine.undo(&id, renamed.batch_id).unwrap();
    assert_eq!(retried.applied_count, 1);
    assert_eq!(
        engine
            .store()
            .get(&id)
            .unwrap()
            .find_node(&node("louvre"))
            .unwrap()
            .title,
        "Louvre"
    );
}

#[test]
fn undo_of_an_undo_restores_the_applied_state() {
    let (engine, _bus, id) = harness("t1", Limits::default());

    let applied = engine
        .apply(
            &id,
            ChangeSet::new(vec![
                ChangeOp::MoveNode {
                    node: node("louvre"),
                    to_day: day(2),
                    position: None,
                },
                ChangeOp::UpdateNode {
                    node: node("bistro"),
                    patch: NodePatch {
                        cost_minor: Patch::Set(2500),
                        ..NodePatch::default()
                    },
                },
            ]),
        )
        .unwrap();
    let after_apply = (*engine.store().get(&id).unwrap()).clone();

    let undone = engine.undo(&id, applied.batch_id).unwrap();
    let redone = engine.undo(&id, undone.batch_id).unwrap();

    assert!(redone.rejected.is_empty());
    let after_redo = engine.store().get(&id).unwrap();
    assert!(after_redo.same_content(&after_apply));
    assert_eq!(after_redo.version, 3);
}

#[test]
fn unknown_batch_cannot_be_undone_twice() {
    let (engine, _bus, id) = harness("t1", Limits::default());

    let applied = engine
        .apply(
            &id,
            ChangeSet::new(vec![ChangeOp::LockNode {
                node: node("louvre"),
            }]),
        )
        .unwrap();

    engine.undo(&id, applied.batch_id).unwrap();
    let err = engine.undo(&id, applied.batch_id).unwrap_err();
    assert!(matches!(err, EngineError::UnknownBatch { .. }));
}

#[test]
fn undo_history_is_bounded() {
    let limits = Limits {
        undo_history_per_itinerary: 2,
        ..Limits::default()
    };
    let (engine, _bus, id) = harness("t1", limits);

    let first = engine
        .apply(
            &id,
            ChangeSet::new(vec![ChangeOp::LockNode {
                node: node("louvre"),
            }]),
        )
        .unwrap();
    for target in ["bistro", "hotel"] {
        engine
            .apply(
                &id,
                ChangeSet::new(vec![ChangeOp::LockNode { node: node(target) }]),
            )
            .unwrap();
    }

    assert_eq!(engine.undo_depth(&id), 2);
    // The oldest entry fell off the ledger.
    assert!(matches!(
        engine.undo(&id, first.batch_id),
        Err(EngineError::UnknownBatch { .. })
    ));
}

#[test]
fn concurrent_applies_serialize_through_retry() {
    let (engine, _bus, id) = harness("t1", Limits::default());

    let handles: Vec<_> = ["louvre", "bistro", "hotel"]
        .into_iter()
        .map(|target| {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            std::thread::spawn(move || {
                engine.apply(
                    &id,
                    ChangeSet::new(vec![ChangeOp::LockNode { node: node(target) }]),
                )
            })
        })
        .collect();

    let mut versions = Vec::new();
    for handle in handles {
        let result = handle.join().unwrap().unwrap();
        versions.push(result.new_version);
    }
    versions.sort_unstable();
    assert_eq!(versions, vec![1, 2, 3]);

    let snap = engine.store().get(&id).unwrap();
    assert_eq!(snap.version, 3);
    for target in ["louvre", "bistro", "hotel"] {
        assert!(snap.find_node(&node(target)).unwrap().locked);
    }
}

#[test]
fn retry_budget_exhaustion_surfaces_conflict() {
    let limits = Limits {
        commit_retry_budget: 0,
        ..Limits::default()
    };
    let (engine, _bus, id) = harness("t1", limits);

    // With no retries, at least one of a pair of simultaneous writers can
    // lose. Run until we observe a conflict or conclude the race never
    // materialized (both outcomes are legal; conflict must be well-formed).
    for round in 0..32u32 {
        let a = Arc::clone(&engine);
        let b = Arc::clone(&engine);
        let id_a = id.clone();
        let id_b = id.clone();
        let op = |target: &str| {
            ChangeSet::new(vec![ChangeOp::UpdateNode {
                node: node(target),
                patch: NodePatch {
                    start_minute: Patch::Set(round),
                    ..NodePatch::default()
                },
            }])
        };
        let set_a = op("louvre");
        let set_b = op("bistro");
        let ha = std::thread::spawn(move || a.apply(&id_a, set_a));
        let hb = std::thread::spawn(move || b.apply(&id_b, set_b));
        let results = [ha.join().unwrap(), hb.join().unwrap()];

        if let Some(err) = results.iter().find_map(|r| r.as_ref().err()) {
            assert!(matches!(*err, EngineError::Conflict { attempts: 1, .. }));
            assert!(err.transience().is_retryable());
            return;
        }
    }
    // No interleaving produced a race in 32 rounds; nothing to assert.
}

#[test]
fn apply_publishes_patch_event_to_subscribers() {
    let (engine, bus, id) = harness("t1", Limits::default());
    let sub = bus
        .subscribe(&id, SubjectId::parse("alice").unwrap())
        .unwrap();

    let result = engine
        .apply(
            &id,
            ChangeSet::new(vec![
                ChangeOp::LockNode {
                    node: node("louvre"),
                },
                ChangeOp::MoveNode {
                    node: node("ghost"),
                    to_day: day(2),
                    position: None,
                },
            ]),
        )
        .unwrap();

    let event = sub.try_recv().unwrap();
    assert_eq!(event.kind, EventKind::GraphPatch);
    assert_eq!(event.version, result.new_version);
    assert_eq!(&event.itinerary_id, &id);

    let payload: PatchPayload = serde_json::from_value(event.payload).unwrap();
    assert_eq!(payload.batch_id, result.batch_id);
    assert_eq!(payload.applied.len(), 1);
    assert_eq!(payload.rejected.len(), 1);
}

#[test]
fn fully_rejected_changeset_publishes_nothing() {
    let (engine, bus, id) = harness("t1", Limits::default());
    let sub = bus
        .subscribe(&id, SubjectId::parse("alice").unwrap())
        .unwrap();

    engine
        .apply(
            &id,
            ChangeSet::new(vec![ChangeOp::MoveNode {
                node: node("ghost"),
                to_day: day(2),
                position: None,
            }]),
        )
        .unwrap();

    assert!(sub.try_recv().is_err());
}
