//! Drag previews and group moves.
//!
//! A drag in progress broadcasts every frame but never touches the
//! durable store — only the gesture's end commits. Group moves
//! translate the whole subtree (including connector endpoints and
//! waypoints) as one broadcast batch, with parallel durable writes and
//! whole-batch rollback.

use futures_util::future::join_all;

use uuid::Uuid;

use super::write::{settle, stamped_update, with_retry};
use super::{descendants, effective_lock, notify_on, EngineEvent, SyncEngine};
use crate::object::{translate_waypoints, ObjectPatch};

impl SyncEngine {
    /// Apply a drag-preview patch: optimistic, stamped, broadcast —
    /// never durable. Stale previews are cheap; the drag end commits.
    pub async fn update_object_drag(&self, id: Uuid, patch: ObjectPatch) {
        if !self.can_edit() {
            return;
        }
        if patch.is_empty() {
            return;
        }
        let change = {
            let mut state = self.state.write().await;
            if !state.objects.contains_key(&id) {
                return;
            }
            if let Some(holder) = effective_lock(&state.objects, id) {
                if holder != self.client_id() {
                    log::debug!("Object {id} locked by {holder}, skipping drag");
                    return;
                }
            }
            let (change, _) = stamped_update(&mut state, id, patch.clone());
            if let Some(object) = state.objects.get_mut(&id) {
                patch.apply_to(object);
            }
            change
        };
        self.transport.queue(vec![change]).await;
    }

    /// Commit the final position of a drag gesture.
    pub async fn update_object_drag_end(&self, id: Uuid, patch: ObjectPatch) {
        self.update_object(id, patch).await;
    }

    /// Translate every descendant of `parent_id` by (dx, dy).
    ///
    /// Connector endpoints move with their object; waypoint lists are
    /// re-serialized after translation, and an unparseable list is
    /// cleared rather than left stale. All descriptors go out as one
    /// broadcast batch. With `skip_durable` (mid-gesture) nothing is
    /// persisted; otherwise the per-descendant writes run in parallel
    /// and any failure rolls the whole batch back.
    pub async fn move_group_children(&self, parent_id: Uuid, dx: f64, dy: f64, skip_durable: bool) {
        if !self.can_edit() {
            return;
        }

        let (changes, writes, snapshots) = {
            let mut state = self.state.write().await;
            if !state.objects.contains_key(&parent_id) {
                log::debug!("Group move for unknown parent {parent_id}, skipping");
                return;
            }
            let children = descendants(&state.objects, parent_id);
            if children.is_empty() {
                return;
            }

            let mut changes = Vec::with_capacity(children.len());
            let mut writes = Vec::with_capacity(children.len());
            let mut snapshots = Vec::with_capacity(children.len());
            for oid in children {
                let Some(object) = state.objects.get(&oid) else {
                    continue;
                };
                let prior_clocks = state.clocks.get(&oid).cloned().unwrap_or_default();
                snapshots.push((object.clone(), prior_clocks));

                let mut patch = ObjectPatch::position(object.x + dx, object.y + dy);
                if let (Some(x2), Some(y2)) = (object.x2, object.y2) {
                    patch.x2 = Some(x2 + dx);
                    patch.y2 = Some(y2 + dy);
                }
                if let Some(raw) = &object.waypoints {
                    patch.waypoints = Some(translate_waypoints(raw, dx, dy));
                }

                let (change, fragment) = stamped_update(&mut state, oid, patch.clone());
                if let Some(object) = state.objects.get_mut(&oid) {
                    patch.apply_to(object);
                }
                changes.push(change);
                writes.push((oid, patch, fragment));
            }
            if !skip_durable {
                state.pending.entry(parent_id).or_default();
            }
            (changes, writes, snapshots)
        };

        self.transport.queue(changes).await;
        if skip_durable {
            return;
        }

        let store = self.store.clone();
        let board = self.board_id();
        let state = self.state.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let attempts = writes.iter().map(|(oid, patch, fragment)| {
                let store = store.clone();
                let config = config.clone();
                async move {
                    with_retry(&config, || {
                        let store = store.clone();
                        let patch = patch.clone();
                        let fragment = fragment.clone();
                        async move { store.update_fields(board, *oid, &patch, &fragment).await }
                    })
                    .await
                }
            });
            let results = join_all(attempts).await;

            let failures = results.iter().filter(|r| r.is_err()).count();
            if failures == 0 {
                settle(&state, parent_id, true).await;
                return;
            }

            log::warn!("Group move persisted with {failures} failures, rolling back");
            {
                let mut state = state.write().await;
                for (object, clocks) in snapshots {
                    state.clocks.set_object_clocks(object.id, clocks);
                    state.objects.insert(object.id, object);
                }
            }
            notify_on(
                &events,
                EngineEvent::Notice(format!("Failed to move group ({failures} objects)")),
            );
            settle(&state, parent_id, false).await;
        });
    }
}
