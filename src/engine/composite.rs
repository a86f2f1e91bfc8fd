//! Composite operations: subtree duplication and z-order batches.

use futures_util::future::join_all;
use std::collections::HashMap;
use uuid::Uuid;

use super::write::{settle, stamped_update, with_retry};
use super::{descendants, notify_on, EngineEvent, SyncEngine};
use crate::change::Change;
use crate::clock::wall_clock_ms;
use crate::object::ObjectPatch;
use crate::storage::StoredRow;

impl SyncEngine {
    /// Duplicate an object at the configured offset.
    ///
    /// Leaves delegate to [`SyncEngine::add_object`] with a visual copy
    /// of the source. Containers clone their whole subtree with fresh
    /// ids: the container row is persisted first and broadcast only once
    /// durable, then each child persists independently. A container
    /// persistence failure rolls back every clone.
    ///
    /// Returns the new root id, or `None` when this client may not edit
    /// or the source is unknown.
    pub async fn duplicate_object(&self, id: Uuid) -> Option<Uuid> {
        if !self.can_edit() {
            log::debug!("Viewer role, ignoring duplicate_object");
            return None;
        }
        let (dx, dy) = self.config.duplicate_offset;

        let source = self.state.read().await.objects.get(&id).cloned()?;

        if !source.kind.is_container() {
            let mut overrides = ObjectPatch::visual_copy(&source);
            overrides.parent_id = Some(source.parent_id);
            let clone = self
                .add_object(source.kind, source.x + dx, source.y + dy, overrides)
                .await?;
            return Some(clone.id);
        }

        // Container: clone the subtree with fresh ids, re-pointing every
        // child at its cloned parent.
        let (new_root, clone_rows) = {
            let mut state = self.state.write().await;
            if !state.objects.contains_key(&id) {
                return None;
            }
            let mut subtree = vec![id];
            subtree.extend(descendants(&state.objects, id));

            let id_map: HashMap<Uuid, Uuid> =
                subtree.iter().map(|old| (*old, Uuid::new_v4())).collect();

            let mut clone_rows = Vec::with_capacity(subtree.len());
            for old_id in &subtree {
                let Some(original) = state.objects.get(old_id) else {
                    continue;
                };
                let mut clone = original.clone();
                clone.id = id_map[old_id];
                clone.x += dx;
                clone.y += dy;
                clone.x2 = clone.x2.map(|v| v + dx);
                clone.y2 = clone.y2.map(|v| v + dy);
                if let Some(raw) = &original.waypoints {
                    clone.waypoints = crate::object::translate_waypoints(raw, dx, dy);
                }
                // Children follow their cloned parent; the root keeps
                // the source's parent
                clone.parent_id = clone
                    .parent_id
                    .map(|p| id_map.get(&p).copied().unwrap_or(p));
                clone.created_by = self.client_id();
                clone.locked_by = None;
                clone.deleted_at = None;
                clone.updated_at = wall_clock_ms();

                let names = clone.populated_fields();
                let fragment = state.clocks.stamp_create(clone.id, &names);
                state.objects.insert(clone.id, clone.clone());
                clone_rows.push(StoredRow {
                    object: clone,
                    clocks: fragment,
                });
            }
            let new_root = id_map[&id];
            state.pending.entry(new_root).or_default();
            (new_root, clone_rows)
        };

        let store = self.store.clone();
        let board = self.board_id();
        let state = self.state.clone();
        let transport = self.transport.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let Some((container, children)) = clone_rows.split_first() else {
                settle(&state, new_root, false).await;
                return;
            };

            let container_result = with_retry(&config, || {
                let store = store.clone();
                let row = container.clone();
                async move { store.insert_object(board, row).await }
            })
            .await;

            if let Err(e) = container_result {
                log::warn!("Duplicate container persist failed: {e}, rolling back clones");
                {
                    let mut state = state.write().await;
                    for row in &clone_rows {
                        state.objects.remove(&row.object.id);
                        state.clocks.remove_object(&row.object.id);
                    }
                }
                notify_on(
                    &events,
                    EngineEvent::Notice(format!("Failed to duplicate: {e}")),
                );
                settle(&state, new_root, false).await;
                return;
            }

            transport
                .queue(vec![Change::create(
                    container.object.clone(),
                    container.clocks.clone(),
                )])
                .await;

            // Children persist independently of one another: one failed
            // child is removed and reported, the rest stand.
            let attempts = children.iter().map(|row| {
                let store = store.clone();
                let config = config.clone();
                async move {
                    let result = with_retry(&config, || {
                        let store = store.clone();
                        let row = row.clone();
                        async move { store.insert_object(board, row).await }
                    })
                    .await;
                    (row, result)
                }
            });
            let mut failed = 0usize;
            for (row, result) in join_all(attempts).await {
                match result {
                    Ok(()) => {
                        transport
                            .queue(vec![Change::create(
                                row.object.clone(),
                                row.clocks.clone(),
                            )])
                            .await;
                    }
                    Err(e) => {
                        log::warn!("Duplicate child {} persist failed: {e}", row.object.id);
                        failed += 1;
                        let mut state = state.write().await;
                        state.objects.remove(&row.object.id);
                        state.clocks.remove_object(&row.object.id);
                    }
                }
            }
            if failed > 0 {
                notify_on(
                    &events,
                    EngineEvent::Notice(format!(
                        "Duplicated with {failed} missing child objects"
                    )),
                );
            }
            settle(&state, new_root, true).await;
        });

        Some(new_root)
    }

    /// Persist a batch of z-order assignments.
    ///
    /// Applies optimistically and broadcasts as one batch; the durable
    /// writes run in parallel and failures aggregate into a single
    /// notice. Stacking order is cosmetic, so there is no rollback —
    /// the next reload converges it.
    pub async fn persist_z_index_batch(&self, updates: Vec<(Uuid, i64)>) {
        if !self.can_edit() {
            return;
        }
        if updates.is_empty() {
            return;
        }

        let (changes, writes) = {
            let mut state = self.state.write().await;
            let mut changes = Vec::with_capacity(updates.len());
            let mut writes = Vec::with_capacity(updates.len());
            for (id, z_index) in updates {
                if !state.objects.contains_key(&id) {
                    continue;
                }
                let patch = ObjectPatch {
                    z_index: Some(z_index),
                    ..ObjectPatch::default()
                };
                let (change, fragment) = stamped_update(&mut state, id, patch.clone());
                if let Some(object) = state.objects.get_mut(&id) {
                    patch.apply_to(object);
                }
                changes.push(change);
                writes.push((id, patch, fragment));
            }
            (changes, writes)
        };
        if writes.is_empty() {
            return;
        }

        self.transport.queue(changes).await;

        let store = self.store.clone();
        let board = self.board_id();
        let events = self.events.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let attempts = writes.iter().map(|(id, patch, fragment)| {
                let store = store.clone();
                let config = config.clone();
                async move {
                    with_retry(&config, || {
                        let store = store.clone();
                        let patch = patch.clone();
                        let fragment = fragment.clone();
                        async move { store.update_fields(board, *id, &patch, &fragment).await }
                    })
                    .await
                }
            });
            let failures = join_all(attempts)
                .await
                .iter()
                .filter(|r| r.is_err())
                .count();
            if failures > 0 {
                log::warn!("Z-order batch finished with {failures} failures");
                notify_on(
                    &events,
                    EngineEvent::Notice(format!(
                        "Failed to save stacking order for {failures} objects"
                    )),
                );
            }
        });
    }
}
