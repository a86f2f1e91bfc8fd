//! Synchronization engine: optimistic local mutation over a durable
//! store and a realtime channel.
//!
//! ```text
//!        user action                     remote batch
//!            │                                │
//!            ▼                                ▼
//! ┌──────────────────────┐  drain task  ┌───────────────┐
//! │      SyncEngine      │ ◄─────────── │   Broadcast   │
//! │  objects + clocks    │              │   Transport   │
//! │  pending persists    │ ───────────► │ (queue/flush) │
//! └──────────┬───────────┘   outbound   └───────────────┘
//!            │ spawned, retried
//!            ▼
//!    ┌───────────────┐
//!    │ DurableStore  │
//!    └───────────────┘
//! ```
//!
//! Every mutation applies to local state immediately; durability and
//! broadcast follow asynchronously. Create, update and delete broadcast
//! only after the durable write succeeds; drag previews broadcast
//! immediately and never touch the store. An exhausted retry rolls the
//! optimistic apply back and surfaces a [`EngineEvent::Notice`].
//!
//! Policy rejections — viewer role, a lock held by another client, an
//! unknown id, a containment cycle — are silent no-ops logged at debug
//! level. Correctness across a disconnect is owed to
//! [`SyncEngine::reconcile_on_reconnect`], never to any individual send.

mod composite;
mod drag;
mod write;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::{BroadcastConfig, BroadcastTransport, TransportStats};
use crate::change::Change;
use crate::channel::RealtimeChannel;
use crate::clock::{FieldClockStore, FIELD_DELETED};
use crate::object::{BoardObject, ObjectPatch};
use crate::storage::{DurableStore, MergeEntry, StoreError};

/// Tombstone handling for deletions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Set `deleted_at` and keep the row (resurrectable, reconcilable).
    Soft,
    /// Remove rows outright, children before the parent.
    Hard,
}

/// What this client is allowed to do on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Editor,
    Viewer,
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total durable-write attempts before giving up and rolling back.
    pub max_retries: u32,
    /// Delay between attempts.
    pub retry_backoff: Duration,
    pub delete_mode: DeleteMode,
    /// Row cap for a board load; exceeding boards are truncated with a
    /// logged diagnostic.
    pub max_load_rows: usize,
    /// (dx, dy) applied to duplicated objects.
    pub duplicate_offset: (f64, f64),
    pub broadcast: BroadcastConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(150),
            delete_mode: DeleteMode::Soft,
            max_load_rows: 1000,
            duplicate_offset: (24.0, 24.0),
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            retry_backoff: Duration::from_millis(10),
            broadcast: BroadcastConfig::for_testing(),
            ..Self::default()
        }
    }
}

/// Observable engine lifecycle events.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A board load completed.
    Loaded { object_count: usize },
    /// A merged remote batch was applied to local state.
    RemoteApplied { object_ids: Vec<Uuid> },
    /// A user-facing problem report (persistence gave up, load failed).
    Notice(String),
}

/// Shared mutable state behind one RwLock: the optimistic object map,
/// the per-field clocks, and the in-flight persistence waiters.
pub(crate) struct EngineState {
    pub(crate) objects: HashMap<Uuid, BoardObject>,
    pub(crate) clocks: FieldClockStore,
    pub(crate) pending: HashMap<Uuid, Vec<oneshot::Sender<bool>>>,
}

impl EngineState {
    fn new(client_id: Uuid) -> Self {
        Self {
            objects: HashMap::new(),
            clocks: FieldClockStore::new(client_id),
            pending: HashMap::new(),
        }
    }
}

/// Per-client, per-board synchronization engine.
pub struct SyncEngine {
    board_id: Uuid,
    client_id: Uuid,
    role: Role,
    pub(crate) config: EngineConfig,
    pub(crate) state: Arc<RwLock<EngineState>>,
    pub(crate) store: Arc<dyn DurableStore>,
    pub(crate) transport: Arc<BroadcastTransport>,
    pub(crate) events: mpsc::Sender<EngineEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<EngineEvent>>>,
    drain_task: Option<tokio::task::JoinHandle<()>>,
}

impl SyncEngine {
    pub fn new(
        board_id: Uuid,
        client_id: Uuid,
        role: Role,
        store: Arc<dyn DurableStore>,
        channel: Arc<dyn RealtimeChannel>,
        config: EngineConfig,
    ) -> Self {
        let mut transport =
            BroadcastTransport::new(client_id, board_id, channel, config.broadcast.clone());
        let remote_rx = transport.take_remote_rx();

        let state = Arc::new(RwLock::new(EngineState::new(client_id)));
        let (event_tx, event_rx) = mpsc::channel(256);

        let drain_task = remote_rx.map(|rx| {
            tokio::spawn(remote_drain(state.clone(), event_tx.clone(), rx))
        });

        Self {
            board_id,
            client_id,
            role,
            config,
            state,
            store,
            transport: Arc::new(transport),
            events: event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            drain_task,
        }
    }

    pub fn board_id(&self) -> Uuid {
        self.board_id
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn can_edit(&self) -> bool {
        self.role == Role::Editor
    }

    /// Take the engine event receiver (once).
    pub async fn take_event_rx(&self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.event_rx.lock().await.take()
    }

    /// A copy of one object's current local state.
    pub async fn object(&self, id: Uuid) -> Option<BoardObject> {
        self.state.read().await.objects.get(&id).cloned()
    }

    /// A copy of every live local object.
    pub async fn objects_snapshot(&self) -> Vec<BoardObject> {
        self.state.read().await.objects.values().cloned().collect()
    }

    pub async fn object_count(&self) -> usize {
        self.state.read().await.objects.len()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Load the board from the durable store, replacing local state.
    ///
    /// On failure local state is left untouched; the error is logged and
    /// surfaced as a [`EngineEvent::Notice`].
    pub async fn load_objects(&self) -> Result<usize, StoreError> {
        let rows = match self
            .store
            .fetch_board(self.board_id, self.config.max_load_rows)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                log::warn!("Board {} load failed: {e}", self.board_id);
                self.notify(format!("Failed to load board: {e}"));
                return Err(e);
            }
        };

        let count = rows.len();
        {
            let mut state = self.state.write().await;
            state.objects.clear();
            state.clocks.clear();
            for row in rows {
                state.clocks.set_object_clocks(row.object.id, row.clocks);
                state.objects.insert(row.object.id, row.object);
            }
        }
        log::info!("Loaded {count} objects for board {}", self.board_id);
        self.notify_event(EngineEvent::Loaded {
            object_count: count,
        });
        Ok(count)
    }

    /// Reconnect reconciliation: push every locally strictly-newer field
    /// through one consolidated clock-wins merge, then reload the board.
    ///
    /// When the clock fetch itself fails nothing is merged and nothing
    /// is reloaded — stale local state beats destroying it.
    pub async fn reconcile_on_reconnect(&self) {
        let clock_rows = match self.store.fetch_clocks(self.board_id).await {
            Ok(rows) => rows,
            Err(e) => {
                log::warn!("Reconciliation clock fetch failed: {e}");
                return;
            }
        };
        let stored: HashMap<Uuid, crate::clock::FieldClocks> = clock_rows
            .into_iter()
            .map(|row| (row.object_id, row.clocks))
            .collect();

        let entries = {
            let state = self.state.read().await;
            let mut entries = Vec::new();
            for object_id in state.clocks.object_ids().copied().collect::<Vec<_>>() {
                let Some(local) = state.clocks.get(&object_id) else {
                    continue;
                };
                let remote = stored.get(&object_id);
                let winners: Vec<&str> = local
                    .fields
                    .iter()
                    .filter(|(field, value)| match remote.and_then(|r| r.get(field)) {
                        Some(existing) => **value > *existing,
                        None => true,
                    })
                    .map(|(field, _)| field.as_str())
                    .collect();
                if winners.is_empty() {
                    continue;
                }

                let patch = match state.objects.get(&object_id) {
                    Some(object) => ObjectPatch::from_object(object, &winners),
                    None => {
                        // Locally deleted while offline: the only state
                        // we can push is the tombstone itself.
                        let Some(tombstone) = local.get(FIELD_DELETED) else {
                            continue;
                        };
                        if !winners.contains(&FIELD_DELETED) {
                            continue;
                        }
                        ObjectPatch {
                            deleted_at: Some(Some(tombstone.wall_ms)),
                            ..ObjectPatch::default()
                        }
                    }
                };

                let mut fragment = crate::clock::FieldClocks::new();
                for field in &winners {
                    if let Some(value) = local.get(field) {
                        fragment.set(*field, *value);
                    }
                }
                entries.push(MergeEntry {
                    object_id,
                    patch,
                    clocks: fragment,
                });
            }
            entries
        };

        if !entries.is_empty() {
            log::info!(
                "Reconciling {} locally-newer objects for board {}",
                entries.len(),
                self.board_id
            );
            if let Err(e) = self.store.merge_clock_wins(self.board_id, entries).await {
                log::warn!("Reconciliation merge failed: {e}");
                self.notify(format!("Reconciliation merge failed: {e}"));
            }
        }

        let _ = self.load_objects().await;
    }

    /// Apply a merged remote batch to local state.
    ///
    /// Normally invoked by the transport drain task; exposed for relays
    /// that deliver batches out of band.
    pub async fn apply_remote(&self, changes: Vec<Change>) {
        apply_remote_batch(&self.state, &self.events, changes).await;
    }

    /// Queue changes on the outbound transport (local state untouched).
    pub async fn queue_broadcast(&self, changes: Vec<Change>) {
        self.transport.queue(changes).await;
    }

    /// Flush the outbound transport immediately.
    pub async fn flush_broadcast(&self) {
        self.transport.flush().await;
    }

    pub(crate) fn notify(&self, message: String) {
        self.notify_event(EngineEvent::Notice(message));
    }

    pub(crate) fn notify_event(&self, event: EngineEvent) {
        notify_on(&self.events, event);
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(task) = self.drain_task.take() {
            task.abort();
        }
    }
}

/// Non-blocking event emission; a full or abandoned receiver never
/// stalls a persistence task.
pub(crate) fn notify_on(events: &mpsc::Sender<EngineEvent>, event: EngineEvent) {
    if let Err(e) = events.try_send(event) {
        log::debug!("Engine event dropped: {e}");
    }
}

/// Drain loop feeding merged remote batches into local state.
async fn remote_drain(
    state: Arc<RwLock<EngineState>>,
    events: mpsc::Sender<EngineEvent>,
    mut rx: mpsc::Receiver<Vec<Change>>,
) {
    while let Some(batch) = rx.recv().await {
        apply_remote_batch(&state, &events, batch).await;
    }
}

/// Apply one remote batch: creates insert, updates merge into existing
/// objects only, deletes remove — each gated per field by the clock
/// comparison so stale remote values never clobber newer local ones.
pub(crate) async fn apply_remote_batch(
    state: &Arc<RwLock<EngineState>>,
    events: &mpsc::Sender<EngineEvent>,
    changes: Vec<Change>,
) {
    let mut touched = Vec::new();
    {
        let mut state = state.write().await;
        for change in changes {
            match change {
                Change::Create { object, clocks, .. } => {
                    let id = object.id;
                    if state.objects.contains_key(&id) {
                        // Duplicate create (relay replay): treat as a
                        // field-wise update of what we already hold.
                        let names = object.populated_fields();
                        let patch = ObjectPatch::from_object(&object, &names);
                        if apply_remote_update(&mut state, id, &patch, &clocks) {
                            touched.push(id);
                        }
                    } else {
                        state.clocks.observe_remote(id, &clocks);
                        state.objects.insert(id, object);
                        touched.push(id);
                    }
                }
                Change::Update {
                    id, patch, clocks, ..
                } => {
                    if !state.objects.contains_key(&id) {
                        log::debug!("Remote update for unknown object {id}, skipping");
                        continue;
                    }
                    if apply_remote_update(&mut state, id, &patch, &clocks) {
                        touched.push(id);
                    }
                }
                Change::Delete { id, clocks, .. } => {
                    let Some(incoming) = clocks.get(FIELD_DELETED) else {
                        continue;
                    };
                    // Add-wins: any local field written after the delete
                    // keeps the object alive.
                    let resurrected = state.clocks.get(&id).is_some_and(|local| {
                        local
                            .fields
                            .iter()
                            .any(|(field, value)| field != FIELD_DELETED && value > incoming)
                    });
                    state.clocks.observe_remote(id, &clocks);
                    if resurrected {
                        log::debug!("Remote delete of {id} lost to a newer local write");
                        continue;
                    }
                    if state.objects.remove(&id).is_some() {
                        touched.push(id);
                    }
                }
            }
        }
    }

    if !touched.is_empty() {
        notify_on(events, EngineEvent::RemoteApplied { object_ids: touched });
    }
}

/// Merge a remote patch into an existing object, keeping only the
/// fields whose incoming clock beats the locally stored one.
///
/// Returns true when any field was applied.
fn apply_remote_update(
    state: &mut EngineState,
    id: Uuid,
    patch: &ObjectPatch,
    incoming: &crate::clock::FieldClocks,
) -> bool {
    let winners: Vec<&str> = {
        let local = state.clocks.get(&id);
        incoming
            .fields
            .iter()
            .filter(|(field, value)| match local.and_then(|l| l.get(field)) {
                Some(existing) => **value > *existing,
                None => true,
            })
            .map(|(field, _)| field.as_str())
            .collect()
    };
    state.clocks.observe_remote(id, incoming);
    if winners.is_empty() {
        return false;
    }
    let projected = patch.project(&winners);
    if projected.is_empty() {
        return false;
    }
    if let Some(object) = state.objects.get_mut(&id) {
        projected.apply_to(object);
        return true;
    }
    false
}

/// Effective lock holder for an object: its own lock, or the nearest
/// locked ancestor's.
pub(crate) fn effective_lock(objects: &HashMap<Uuid, BoardObject>, id: Uuid) -> Option<Uuid> {
    let mut current = Some(id);
    let mut hops = 0;
    while let Some(oid) = current {
        let object = objects.get(&oid)?;
        if let Some(holder) = object.locked_by {
            return Some(holder);
        }
        current = object.parent_id;
        // Corrupt parent chains must not hang the caller
        hops += 1;
        if hops > 64 {
            return None;
        }
    }
    None
}

/// Transitive children of `root`, excluding `root` itself.
pub(crate) fn descendants(objects: &HashMap<Uuid, BoardObject>, root: Uuid) -> Vec<Uuid> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(parent) = stack.pop() {
        for (id, object) in objects {
            if object.parent_id == Some(parent) {
                out.push(*id);
                stack.push(*id);
            }
        }
    }
    out
}

/// True when `candidate` sits in `of`'s subtree (used to reject
/// containment cycles before they form).
pub(crate) fn is_in_subtree(
    objects: &HashMap<Uuid, BoardObject>,
    candidate: Uuid,
    of: Uuid,
) -> bool {
    let mut current = Some(candidate);
    let mut hops = 0;
    while let Some(oid) = current {
        if oid == of {
            return true;
        }
        current = objects.get(&oid).and_then(|o| o.parent_id);
        hops += 1;
        if hops > 64 {
            return false;
        }
    }
    false
}
