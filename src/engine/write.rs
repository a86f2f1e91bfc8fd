//! Durable write operations: create, update, delete.
//!
//! Each mutation applies optimistically under the state lock, stamps
//! fresh field clocks, then spawns a persistence task that retries a
//! bounded number of times. Broadcast happens only after the durable
//! write succeeds; an exhausted retry rolls the optimistic apply back
//! and emits a notice.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

use super::{
    descendants, effective_lock, is_in_subtree, notify_on, DeleteMode, EngineConfig, EngineEvent,
    EngineState, SyncEngine,
};
use crate::change::Change;
use crate::clock::{wall_clock_ms, FieldClocks};
use crate::object::{BoardObject, ObjectKind, ObjectPatch};
use crate::storage::{StoreError, StoredRow};

impl SyncEngine {
    /// Create an object at (x, y) with kind defaults overlaid by
    /// `overrides`, and persist it in the background.
    ///
    /// Returns the optimistic object immediately; `None` when this
    /// client may not edit. Use [`SyncEngine::wait_for_persist`] to
    /// observe the durable outcome.
    pub async fn add_object(
        &self,
        kind: ObjectKind,
        x: f64,
        y: f64,
        overrides: ObjectPatch,
    ) -> Option<BoardObject> {
        if !self.can_edit() {
            log::debug!("Viewer role, ignoring add_object");
            return None;
        }
        let mut object = BoardObject::new(kind, self.board_id(), x, y, self.client_id());
        overrides.apply_to(&mut object);
        self.insert_optimistic(object, false).await
    }

    /// Re-insert an object with its caller-supplied id (the delete-undo
    /// path). Uses an upsert so a lingering tombstoned row is replaced.
    pub async fn add_object_with_id(&self, object: BoardObject) -> Option<BoardObject> {
        if !self.can_edit() {
            log::debug!("Viewer role, ignoring add_object_with_id");
            return None;
        }
        self.insert_optimistic(object, true).await
    }

    async fn insert_optimistic(&self, object: BoardObject, upsert: bool) -> Option<BoardObject> {
        let id = object.id;
        let fragment = {
            let mut state = self.state.write().await;
            let names = object.populated_fields();
            let fragment = state.clocks.stamp_create(id, &names);
            state.objects.insert(id, object.clone());
            state.pending.entry(id).or_default();
            fragment
        };

        let store = self.store.clone();
        let board = self.board_id();
        let state = self.state.clone();
        let transport = self.transport.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        let row = StoredRow {
            object: object.clone(),
            clocks: fragment.clone(),
        };
        tokio::spawn(async move {
            let result = with_retry(&config, || {
                let store = store.clone();
                let row = row.clone();
                async move {
                    if upsert {
                        store.upsert_object(board, row).await
                    } else {
                        store.insert_object(board, row).await
                    }
                }
            })
            .await;

            match result {
                Ok(()) => {
                    transport
                        .queue(vec![Change::create(row.object, row.clocks)])
                        .await;
                    settle(&state, id, true).await;
                }
                Err(e) => {
                    log::warn!("Create of {id} failed after retries: {e}");
                    {
                        let mut state = state.write().await;
                        state.objects.remove(&id);
                        state.clocks.remove_object(&id);
                    }
                    notify_on(
                        &events,
                        EngineEvent::Notice(format!("Failed to save new object: {e}")),
                    );
                    settle(&state, id, false).await;
                }
            }
        });

        Some(object)
    }

    /// Apply a patch to an object and persist it in the background.
    ///
    /// Silent no-op when: this client is a viewer, the id is unknown,
    /// the patch is empty, the object (or an ancestor) is locked by
    /// another client and the patch is not a pure lock/unlock, or the
    /// patch would create a containment cycle.
    pub async fn update_object(&self, id: Uuid, patch: ObjectPatch) {
        if !self.can_edit() {
            log::debug!("Viewer role, ignoring update_object");
            return;
        }
        if patch.is_empty() {
            return;
        }

        let (snapshot, fragment) = {
            let mut state = self.state.write().await;
            let Some(existing) = state.objects.get(&id) else {
                log::debug!("Update for unknown object {id}, skipping");
                return;
            };
            let snapshot = existing.clone();

            // A lock held by someone else blocks everything except
            // setting or releasing the lock itself.
            if let Some(holder) = effective_lock(&state.objects, id) {
                if holder != self.client_id() && !patch.is_lock_only() {
                    log::debug!("Object {id} locked by {holder}, skipping update");
                    return;
                }
            }
            if let Some(Some(new_parent)) = patch.parent_id {
                if is_in_subtree(&state.objects, new_parent, id) {
                    log::debug!("Re-parent of {id} under {new_parent} would cycle, skipping");
                    return;
                }
            }

            let names = patch.field_names();
            let fragment = state.clocks.stamp_change(id, &names);
            if let Some(object) = state.objects.get_mut(&id) {
                patch.apply_to(object);
            }
            state.pending.entry(id).or_default();
            (snapshot, fragment)
        };

        let store = self.store.clone();
        let board = self.board_id();
        let state = self.state.clone();
        let transport = self.transport.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let result = with_retry(&config, || {
                let store = store.clone();
                let patch = patch.clone();
                let fragment = fragment.clone();
                async move { store.update_fields(board, id, &patch, &fragment).await }
            })
            .await;

            match result {
                Ok(()) => {
                    transport.queue(vec![Change::update(id, patch, fragment)]).await;
                    settle(&state, id, true).await;
                }
                Err(e) => {
                    log::warn!("Update of {id} failed after retries: {e}");
                    {
                        let mut state = state.write().await;
                        // Restore the pre-patch snapshot unless the
                        // object has since vanished
                        if let Some(object) = state.objects.get_mut(&id) {
                            *object = snapshot;
                        }
                    }
                    notify_on(
                        &events,
                        EngineEvent::Notice(format!("Failed to save changes: {e}")),
                    );
                    settle(&state, id, false).await;
                }
            }
        });
    }

    /// Delete an object and its whole descendant subtree as one unit.
    ///
    /// Soft mode tombstones every row in one batch; hard mode removes
    /// children first, then the root. A persistence failure restores
    /// the entire subtree.
    pub async fn delete_object(&self, id: Uuid) {
        if !self.can_edit() {
            log::debug!("Viewer role, ignoring delete_object");
            return;
        }

        let (ids, snapshots, fragments, changes, deleted_at) = {
            let mut state = self.state.write().await;
            if !state.objects.contains_key(&id) {
                log::debug!("Delete for unknown object {id}, skipping");
                return;
            }
            if let Some(holder) = effective_lock(&state.objects, id) {
                if holder != self.client_id() {
                    log::debug!("Object {id} locked by {holder}, skipping delete");
                    return;
                }
            }

            let mut ids = vec![id];
            ids.extend(descendants(&state.objects, id));

            let mut snapshots = Vec::with_capacity(ids.len());
            let mut fragments = HashMap::with_capacity(ids.len());
            let mut changes = Vec::with_capacity(ids.len());
            let deleted_at = wall_clock_ms();
            for oid in &ids {
                let prior_clocks = state.clocks.get(oid).cloned().unwrap_or_default();
                if let Some(object) = state.objects.remove(oid) {
                    snapshots.push((object, prior_clocks));
                }
                let fragment = state.clocks.stamp_delete(*oid);
                fragments.insert(*oid, fragment.clone());
                changes.push(Change::delete(*oid, fragment));
            }
            state.pending.entry(id).or_default();
            (ids, snapshots, fragments, changes, deleted_at)
        };

        let store = self.store.clone();
        let board = self.board_id();
        let state = self.state.clone();
        let transport = self.transport.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        let mode = self.config.delete_mode;
        tokio::spawn(async move {
            let result = with_retry(&config, || {
                let store = store.clone();
                let ids = ids.clone();
                let fragments = fragments.clone();
                async move {
                    match mode {
                        DeleteMode::Soft => {
                            store
                                .tombstone_objects(board, &ids, deleted_at, &fragments)
                                .await
                        }
                        DeleteMode::Hard => {
                            // Children first so a mid-failure never
                            // leaves orphans pointing at a gone parent
                            if ids.len() > 1 {
                                store.delete_objects(board, &ids[1..]).await?;
                            }
                            store.delete_objects(board, &ids[..1]).await
                        }
                    }
                }
            })
            .await;

            match result {
                Ok(()) => {
                    transport.queue(changes).await;
                    settle(&state, id, true).await;
                }
                Err(e) => {
                    log::warn!("Delete of {id} failed after retries: {e}");
                    {
                        let mut state = state.write().await;
                        for (object, clocks) in snapshots {
                            state.clocks.set_object_clocks(object.id, clocks);
                            state.objects.insert(object.id, object);
                        }
                    }
                    notify_on(
                        &events,
                        EngineEvent::Notice(format!("Failed to delete: {e}")),
                    );
                    settle(&state, id, false).await;
                }
            }
        });
    }

    /// Wait for the in-flight persistence of `id` to settle.
    ///
    /// Resolves `true` on durable success, `false` on rollback, and
    /// immediately `true` when nothing is in flight for the id.
    pub async fn wait_for_persist(&self, id: Uuid) -> bool {
        let rx = {
            let mut state = self.state.write().await;
            match state.pending.get_mut(&id) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => None,
            }
        };
        match rx {
            Some(rx) => rx.await.unwrap_or(false),
            None => true,
        }
    }
}

/// Resolve every waiter registered for `id`.
pub(crate) async fn settle(state: &Arc<RwLock<EngineState>>, id: Uuid, ok: bool) {
    let waiters = state.write().await.pending.remove(&id);
    if let Some(waiters) = waiters {
        for waiter in waiters {
            let _ = waiter.send(ok);
        }
    }
}

/// Run a durable write with bounded retries and backoff.
pub(crate) async fn with_retry<F, Fut>(config: &EngineConfig, op: F) -> Result<(), StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if attempt >= config.max_retries {
                    return Err(e);
                }
                log::debug!("Durable write attempt {attempt} failed: {e}, retrying");
                tokio::time::sleep(config.retry_backoff).await;
            }
        }
    }
}

/// Stamp-and-wrap helper shared by the drag and composite paths: stamp
/// the patch's fields for `id` and return the matching descriptor.
pub(crate) fn stamped_update(
    state: &mut EngineState,
    id: Uuid,
    patch: ObjectPatch,
) -> (Change, FieldClocks) {
    let names = patch.field_names();
    let fragment = state.clocks.stamp_change(id, &names);
    (Change::update(id, patch, fragment.clone()), fragment)
}
