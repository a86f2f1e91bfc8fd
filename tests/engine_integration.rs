//! End-to-end engine scenarios over a loopback channel and a shared
//! in-memory store: two clients on one board, optimistic writes,
//! batched broadcast, retry/rollback, and reconnect reconciliation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

use boardsync::engine::{EngineConfig, EngineEvent, Role, SyncEngine};
use boardsync::object::fields;
use boardsync::{
    BroadcastConfig, Change, DurableStore, LoopbackChannel, MemoryStore, ObjectKind, ObjectPatch,
    RealtimeChannel, WireMessage,
};

struct Rig {
    store: Arc<MemoryStore>,
    channel: Arc<LoopbackChannel>,
    board: Uuid,
}

impl Rig {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            channel: Arc::new(LoopbackChannel::new(256)),
            board: Uuid::new_v4(),
        }
    }

    fn engine(&self, role: Role) -> SyncEngine {
        SyncEngine::new(
            self.board,
            Uuid::new_v4(),
            role,
            self.store.clone(),
            self.channel.clone(),
            EngineConfig::for_testing(),
        )
    }

    fn editor(&self) -> SyncEngine {
        self.engine(Role::Editor)
    }
}

/// Poll until the condition holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_create_propagates_to_second_client() {
    let rig = Rig::new();
    let a = rig.editor();
    let b = rig.editor();

    let created = a
        .add_object(ObjectKind::Sticky, 100.0, 200.0, ObjectPatch::default())
        .await
        .expect("editor may create");
    assert!(a.wait_for_persist(created.id).await);
    a.flush_broadcast().await;

    let id = created.id;
    assert!(
        eventually(|| async {
            match b.object(id).await {
                Some(obj) => obj.x == 100.0 && obj.y == 200.0,
                None => false,
            }
        })
        .await,
        "second client should receive the created object at (100, 200)"
    );
}

#[tokio::test]
async fn test_updates_within_idle_window_send_one_message() {
    let rig = Rig::new();
    let a = rig.editor();
    let mut raw = rig.channel.subscribe();

    let created = a
        .add_object(ObjectKind::Rect, 0.0, 0.0, ObjectPatch::default())
        .await
        .unwrap();
    assert!(a.wait_for_persist(created.id).await);
    a.flush_broadcast().await;
    // Drain the create message
    let _ = timeout(Duration::from_secs(1), raw.recv()).await;

    a.update_object(
        created.id,
        ObjectPatch {
            x: Some(50.0),
            ..ObjectPatch::default()
        },
    )
    .await;
    a.update_object(
        created.id,
        ObjectPatch {
            y: Some(60.0),
            ..ObjectPatch::default()
        },
    )
    .await;
    assert!(a.wait_for_persist(created.id).await);

    let msg: Arc<WireMessage> = timeout(Duration::from_secs(1), raw.recv())
        .await
        .expect("idle timer should flush")
        .unwrap();
    assert_eq!(msg.changes.len(), 1, "both updates merge into one descriptor");
    match &msg.changes[0] {
        Change::Update { patch, .. } => {
            assert_eq!(patch.x, Some(50.0));
            assert_eq!(patch.y, Some(60.0));
        }
        other => panic!("expected update, got {other:?}"),
    }

    // And nothing else follows for this burst
    sleep(Duration::from_millis(100)).await;
    assert!(raw.try_recv().is_err());
}

#[tokio::test]
async fn test_exhausted_retry_rolls_back_without_broadcast() {
    let rig = Rig::new();
    let a = rig.editor();
    let mut events = a.take_event_rx().await.unwrap();
    let mut raw = rig.channel.subscribe();

    rig.store.fail_next_writes(u32::MAX);
    let created = a
        .add_object(ObjectKind::Rect, 5.0, 5.0, ObjectPatch::default())
        .await
        .unwrap();

    assert!(!a.wait_for_persist(created.id).await, "persist must fail");
    assert!(a.object(created.id).await.is_none(), "optimistic apply rolled back");

    a.flush_broadcast().await;
    sleep(Duration::from_millis(50)).await;
    assert!(raw.try_recv().is_err(), "failed creates are never broadcast");

    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("a notice should surface")
        .unwrap();
    assert!(matches!(event, EngineEvent::Notice(_)));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let rig = Rig::new();
    let a = rig.editor();

    // Two failures, three attempts allowed
    rig.store.fail_next_writes(2);
    let created = a
        .add_object(ObjectKind::Rect, 1.0, 2.0, ObjectPatch::default())
        .await
        .unwrap();

    assert!(a.wait_for_persist(created.id).await);
    assert_eq!(rig.store.write_calls(), 3);
    assert!(rig.store.row(rig.board, created.id).await.is_some());
}

#[tokio::test]
async fn test_update_rollback_restores_snapshot() {
    let rig = Rig::new();
    let a = rig.editor();

    let created = a
        .add_object(ObjectKind::Rect, 10.0, 10.0, ObjectPatch::default())
        .await
        .unwrap();
    assert!(a.wait_for_persist(created.id).await);

    rig.store.fail_next_writes(u32::MAX);
    a.update_object(created.id, ObjectPatch::position(999.0, 999.0))
        .await;
    assert!(!a.wait_for_persist(created.id).await);

    let object = a.object(created.id).await.unwrap();
    assert_eq!((object.x, object.y), (10.0, 10.0), "snapshot restored");
}

#[tokio::test]
async fn test_reconcile_with_no_local_wins_reloads_without_merging() {
    let rig = Rig::new();
    let a = rig.editor();

    let created = a
        .add_object(ObjectKind::Rect, 3.0, 4.0, ObjectPatch::default())
        .await
        .unwrap();
    assert!(a.wait_for_persist(created.id).await);

    a.reconcile_on_reconnect().await;

    assert_eq!(
        rig.store.merge_calls(),
        0,
        "no strictly-newer local field, so no merge"
    );
    assert_eq!(a.object_count().await, 1, "the board was still reloaded");
    assert!(a.object(created.id).await.is_some());
}

#[tokio::test]
async fn test_reconcile_pushes_locally_newer_fields() {
    let rig = Rig::new();
    let a = rig.editor();

    let created = a
        .add_object(ObjectKind::Rect, 0.0, 0.0, ObjectPatch::default())
        .await
        .unwrap();
    assert!(a.wait_for_persist(created.id).await);

    // Drag previews stamp fresh clocks without a durable write, leaving
    // local state strictly ahead of the store.
    a.update_object_drag(created.id, ObjectPatch::position(77.0, 88.0))
        .await;
    a.reconcile_on_reconnect().await;

    assert_eq!(rig.store.merge_calls(), 1);
    let row = rig.store.row(rig.board, created.id).await.unwrap();
    assert_eq!((row.object.x, row.object.y), (77.0, 88.0));
    // And the reload kept the reconciled value
    let object = a.object(created.id).await.unwrap();
    assert_eq!((object.x, object.y), (77.0, 88.0));
}

#[tokio::test]
async fn test_lock_by_other_client_is_silent_noop() {
    let rig = Rig::new();
    let a = rig.editor();

    let other = Uuid::new_v4();
    let created = a
        .add_object(
            ObjectKind::Rect,
            1.0,
            1.0,
            ObjectPatch {
                locked_by: Some(Some(other)),
                ..ObjectPatch::default()
            },
        )
        .await
        .unwrap();
    assert!(a.wait_for_persist(created.id).await);
    let baseline = rig.store.write_calls();

    a.update_object(created.id, ObjectPatch::position(50.0, 50.0))
        .await;
    a.delete_object(created.id).await;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(
        rig.store.write_calls(),
        baseline,
        "locked-object mutations never reach the store"
    );
    let object = a.object(created.id).await.unwrap();
    assert_eq!((object.x, object.y), (1.0, 1.0));

    // The escape hatch: releasing the lock is always allowed
    a.update_object(
        created.id,
        ObjectPatch {
            locked_by: Some(None),
            ..ObjectPatch::default()
        },
    )
    .await;
    assert!(a.wait_for_persist(created.id).await);
    assert_eq!(a.object(created.id).await.unwrap().locked_by, None);
}

#[tokio::test]
async fn test_drag_broadcasts_without_durable_writes() {
    let rig = Rig::new();
    let a = rig.editor();
    let b = rig.editor();

    let created = a
        .add_object(ObjectKind::Rect, 0.0, 0.0, ObjectPatch::default())
        .await
        .unwrap();
    assert!(a.wait_for_persist(created.id).await);
    a.flush_broadcast().await;
    let id = created.id;
    assert!(eventually(|| async { b.object(id).await.is_some() }).await);
    let baseline = rig.store.write_calls();

    for i in 1..=5 {
        a.update_object_drag(id, ObjectPatch::position(f64::from(i) * 10.0, 0.0))
            .await;
    }
    a.flush_broadcast().await;

    assert!(
        eventually(|| async { b.object(id).await.is_some_and(|o| o.x == 50.0) }).await,
        "drag previews propagate to peers"
    );
    assert_eq!(
        rig.store.write_calls(),
        baseline,
        "drag previews never touch the store"
    );

    // The gesture end commits durably
    a.update_object_drag_end(id, ObjectPatch::position(50.0, 0.0))
        .await;
    assert!(a.wait_for_persist(id).await);
    assert_eq!(rig.store.row(rig.board, id).await.unwrap().object.x, 50.0);
}

#[tokio::test]
async fn test_move_group_children_translates_subtree_exactly() {
    let rig = Rig::new();
    let a = rig.editor();

    let frame = a
        .add_object(ObjectKind::Frame, 0.0, 0.0, ObjectPatch::default())
        .await
        .unwrap();
    assert!(a.wait_for_persist(frame.id).await);

    let child = a
        .add_object(
            ObjectKind::Rect,
            10.0,
            20.0,
            ObjectPatch {
                parent_id: Some(Some(frame.id)),
                ..ObjectPatch::default()
            },
        )
        .await
        .unwrap();
    let connector = a
        .add_object(
            ObjectKind::Connector,
            30.0,
            40.0,
            ObjectPatch {
                parent_id: Some(Some(frame.id)),
                x2: Some(130.0),
                y2: Some(40.0),
                waypoints: Some(Some("[[50.0,50.0],[60.0,45.0]]".to_string())),
                ..ObjectPatch::default()
            },
        )
        .await
        .unwrap();
    let corrupt = a
        .add_object(
            ObjectKind::Connector,
            0.0,
            0.0,
            ObjectPatch {
                parent_id: Some(Some(frame.id)),
                waypoints: Some(Some("not json".to_string())),
                ..ObjectPatch::default()
            },
        )
        .await
        .unwrap();
    for id in [child.id, connector.id, corrupt.id] {
        assert!(a.wait_for_persist(id).await);
    }

    a.move_group_children(frame.id, 7.0, 9.0, false).await;
    assert!(a.wait_for_persist(frame.id).await);

    let moved_child = a.object(child.id).await.unwrap();
    assert_eq!((moved_child.x, moved_child.y), (17.0, 29.0));

    let moved_connector = a.object(connector.id).await.unwrap();
    assert_eq!((moved_connector.x, moved_connector.y), (37.0, 49.0));
    assert_eq!(moved_connector.x2, Some(137.0));
    assert_eq!(moved_connector.y2, Some(49.0));
    assert_eq!(
        moved_connector.waypoints.as_deref(),
        Some("[[57.0,59.0],[67.0,54.0]]")
    );

    let moved_corrupt = a.object(corrupt.id).await.unwrap();
    assert_eq!(
        moved_corrupt.waypoints, None,
        "unparseable waypoints are cleared, never left stale"
    );

    // Durable rows match the local state
    let row = rig.store.row(rig.board, connector.id).await.unwrap();
    assert_eq!((row.object.x, row.object.y), (37.0, 49.0));
}

#[tokio::test]
async fn test_delete_subtree_tombstones_every_row() {
    let rig = Rig::new();
    let a = rig.editor();

    let frame = a
        .add_object(ObjectKind::Frame, 0.0, 0.0, ObjectPatch::default())
        .await
        .unwrap();
    let child = a
        .add_object(
            ObjectKind::Rect,
            5.0,
            5.0,
            ObjectPatch {
                parent_id: Some(Some(frame.id)),
                ..ObjectPatch::default()
            },
        )
        .await
        .unwrap();
    assert!(a.wait_for_persist(frame.id).await);
    assert!(a.wait_for_persist(child.id).await);

    a.delete_object(frame.id).await;
    assert!(a.wait_for_persist(frame.id).await);

    assert_eq!(a.object_count().await, 0);
    assert!(rig
        .store
        .fetch_board(rig.board, 100)
        .await
        .unwrap()
        .is_empty());
    // Tombstoned rows keep their clocks for reconciliation
    let clock_rows = rig.store.fetch_clocks(rig.board).await.unwrap();
    assert_eq!(clock_rows.len(), 2);
    assert!(clock_rows
        .iter()
        .all(|row| row.clocks.get("__deleted").is_some()));
}

#[tokio::test]
async fn test_viewer_role_cannot_mutate() {
    let rig = Rig::new();
    let viewer = rig.engine(Role::Viewer);

    assert!(viewer
        .add_object(ObjectKind::Rect, 0.0, 0.0, ObjectPatch::default())
        .await
        .is_none());
    viewer
        .update_object(Uuid::new_v4(), ObjectPatch::position(1.0, 1.0))
        .await;
    viewer.delete_object(Uuid::new_v4()).await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(rig.store.write_calls(), 0);
}

#[tokio::test]
async fn test_duplicate_container_clones_subtree_with_fresh_ids() {
    let rig = Rig::new();
    let a = rig.editor();

    let frame = a
        .add_object(ObjectKind::Frame, 0.0, 0.0, ObjectPatch::default())
        .await
        .unwrap();
    let child = a
        .add_object(
            ObjectKind::Sticky,
            10.0,
            10.0,
            ObjectPatch {
                parent_id: Some(Some(frame.id)),
                ..ObjectPatch::default()
            },
        )
        .await
        .unwrap();
    assert!(a.wait_for_persist(frame.id).await);
    assert!(a.wait_for_persist(child.id).await);

    let new_root = a.duplicate_object(frame.id).await.unwrap();
    assert_ne!(new_root, frame.id);
    assert!(a.wait_for_persist(new_root).await);

    assert_eq!(a.object_count().await, 4);
    let clone_root = a.object(new_root).await.unwrap();
    assert_eq!((clone_root.x, clone_root.y), (24.0, 24.0));

    let snapshot = a.objects_snapshot().await;
    let cloned_child = snapshot
        .iter()
        .find(|o| o.parent_id == Some(new_root))
        .expect("child clone re-parented under the new root");
    assert_ne!(cloned_child.id, child.id);
    assert_eq!((cloned_child.x, cloned_child.y), (34.0, 34.0));

    assert!(
        eventually(|| async { rig.store.row(rig.board, new_root).await.is_some() }).await
    );
}

#[tokio::test]
async fn test_stale_remote_update_loses_per_field() {
    let rig = Rig::new();
    let a = rig.editor();

    let created = a
        .add_object(ObjectKind::Rect, 5.0, 6.0, ObjectPatch::default())
        .await
        .unwrap();
    assert!(a.wait_for_persist(created.id).await);

    // A remote update carrying an ancient clock must not clobber
    let mut stale = boardsync::FieldClocks::new();
    stale.set(
        fields::X,
        boardsync::ClockValue {
            wall_ms: 1,
            counter: 0,
            client_id: Uuid::new_v4(),
        },
    );
    a.apply_remote(vec![Change::update(
        created.id,
        ObjectPatch {
            x: Some(555.0),
            ..ObjectPatch::default()
        },
        stale,
    )])
    .await;
    assert_eq!(a.object(created.id).await.unwrap().x, 5.0);

    // A sufficiently newer remote clock wins the field
    let mut newer = boardsync::FieldClocks::new();
    newer.set(
        fields::X,
        boardsync::ClockValue {
            wall_ms: boardsync::clock::wall_clock_ms() + 60_000,
            counter: 0,
            client_id: Uuid::new_v4(),
        },
    );
    a.apply_remote(vec![Change::update(
        created.id,
        ObjectPatch {
            x: Some(777.0),
            ..ObjectPatch::default()
        },
        newer,
    )])
    .await;
    assert_eq!(a.object(created.id).await.unwrap().x, 777.0);
}

#[tokio::test]
async fn test_two_clients_converge_on_concurrent_field_edits() {
    let rig = Rig::new();
    let a = rig.editor();
    let b = rig.editor();

    let created = a
        .add_object(ObjectKind::Rect, 0.0, 0.0, ObjectPatch::default())
        .await
        .unwrap();
    assert!(a.wait_for_persist(created.id).await);
    a.flush_broadcast().await;
    let id = created.id;
    assert!(eventually(|| async { b.object(id).await.is_some() }).await);

    // Disjoint fields from both sides
    a.update_object(
        id,
        ObjectPatch {
            fill: Some("#123456".to_string()),
            ..ObjectPatch::default()
        },
    )
    .await;
    b.update_object(
        id,
        ObjectPatch {
            rotation: Some(45.0),
            ..ObjectPatch::default()
        },
    )
    .await;
    assert!(a.wait_for_persist(id).await);
    assert!(b.wait_for_persist(id).await);
    a.flush_broadcast().await;
    b.flush_broadcast().await;

    assert!(
        eventually(|| async {
            let va = a.object(id).await;
            let vb = b.object(id).await;
            match (va, vb) {
                (Some(va), Some(vb)) => {
                    va.fill.as_deref() == Some("#123456")
                        && vb.fill.as_deref() == Some("#123456")
                        && va.rotation == 45.0
                        && vb.rotation == 45.0
                }
                _ => false,
            }
        })
        .await,
        "both clients settle on the union of disjoint field edits"
    );
}

#[tokio::test]
async fn test_reparent_cycle_is_rejected() {
    let rig = Rig::new();
    let a = rig.editor();

    let outer = a
        .add_object(ObjectKind::Group, 0.0, 0.0, ObjectPatch::default())
        .await
        .unwrap();
    let inner = a
        .add_object(
            ObjectKind::Group,
            0.0,
            0.0,
            ObjectPatch {
                parent_id: Some(Some(outer.id)),
                ..ObjectPatch::default()
            },
        )
        .await
        .unwrap();
    assert!(a.wait_for_persist(outer.id).await);
    assert!(a.wait_for_persist(inner.id).await);

    // outer under inner would make the containment forest a cycle
    a.update_object(
        outer.id,
        ObjectPatch {
            parent_id: Some(Some(inner.id)),
            ..ObjectPatch::default()
        },
    )
    .await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(a.object(outer.id).await.unwrap().parent_id, None);
}

#[tokio::test]
async fn test_offline_broadcast_drops_but_store_persists() {
    let rig = Rig::new();
    let config = EngineConfig {
        broadcast: BroadcastConfig {
            idle_delay: Duration::from_millis(10),
            ..BroadcastConfig::for_testing()
        },
        ..EngineConfig::for_testing()
    };
    let a = SyncEngine::new(
        rig.board,
        Uuid::new_v4(),
        Role::Editor,
        rig.store.clone(),
        rig.channel.clone(),
        config,
    );

    rig.channel.set_joined(false);
    let created = a
        .add_object(ObjectKind::Rect, 1.0, 1.0, ObjectPatch::default())
        .await
        .unwrap();
    assert!(a.wait_for_persist(created.id).await);
    a.flush_broadcast().await;

    assert!(rig.store.row(rig.board, created.id).await.is_some());
    assert_eq!(a.transport_stats().messages_sent, 0);
    assert!(a.transport_stats().messages_dropped >= 1);
}
