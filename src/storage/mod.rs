//! Durable store seam for board objects.
//!
//! The durable store is the system of record; each client's in-memory
//! object map is a cache that may be transiently ahead (optimistic
//! writes) or behind (remote changes not yet received). Rows are keyed
//! by (board, object); clocks are stored alongside so reconciliation
//! can compare without fetching full rows.
//!
//! ```text
//! ┌────────────┐  insert/update/delete  ┌─────────────────┐
//! │ SyncEngine │ ─────────────────────► │  DurableStore   │
//! │ (optimist) │ ◄───────────────────── │ Memory │ Rocks  │
//! └────────────┘  fetch_board / clocks  └─────────────────┘
//! ```

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, RocksStoreConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::clock::FieldClocks;
use crate::object::{BoardObject, ObjectPatch};

/// A durable row: the object plus the clocks that last won its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub object: BoardObject,
    pub clocks: FieldClocks,
}

/// Clock-only projection of a row, for cheap reconciliation fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockRow {
    pub object_id: Uuid,
    pub clocks: FieldClocks,
}

/// One entry of a consolidated clock-wins merge request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeEntry {
    pub object_id: Uuid,
    pub patch: ObjectPatch,
    pub clocks: FieldClocks,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    Database(String),
    NotFound(Uuid),
    Serialization(String),
    Deserialization(String),
    Compression(String),
    /// Transient infrastructure failure; callers retry a bounded
    /// number of times.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Object not found: {id}"),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Compression(e) => write!(f, "Compression error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Row-oriented durable store keyed by object id, queryable by board.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert a new row.
    async fn insert_object(&self, board_id: Uuid, row: StoredRow) -> Result<(), StoreError>;

    /// Insert or replace a row by id (delete-undo re-insertion path).
    async fn upsert_object(&self, board_id: Uuid, row: StoredRow) -> Result<(), StoreError>;

    /// Apply a field-scoped update, overlaying the clock fragment.
    async fn update_fields(
        &self,
        board_id: Uuid,
        object_id: Uuid,
        patch: &ObjectPatch,
        clocks: &FieldClocks,
    ) -> Result<(), StoreError>;

    /// Soft-delete an id set in one batched write: set the tombstone and
    /// record each object's tombstone clock.
    async fn tombstone_objects(
        &self,
        board_id: Uuid,
        ids: &[Uuid],
        deleted_at: u64,
        clocks: &HashMap<Uuid, FieldClocks>,
    ) -> Result<(), StoreError>;

    /// Hard-delete an id set in one batched call.
    async fn delete_objects(&self, board_id: Uuid, ids: &[Uuid]) -> Result<(), StoreError>;

    /// Fetch every non-tombstoned row for a board, capped at `max_rows`.
    async fn fetch_board(
        &self,
        board_id: Uuid,
        max_rows: usize,
    ) -> Result<Vec<StoredRow>, StoreError>;

    /// Fetch only (id, clocks) pairs for a board, tombstoned included.
    async fn fetch_clocks(&self, board_id: Uuid) -> Result<Vec<ClockRow>, StoreError>;

    /// Apply a consolidated merge using the same per-field clock
    /// comparison as local reconciliation: an entry's field is applied
    /// only where its clock is strictly greater than the stored one.
    async fn merge_clock_wins(
        &self,
        board_id: Uuid,
        entries: Vec<MergeEntry>,
    ) -> Result<(), StoreError>;
}

/// Shared clock-wins merge rule, used by both store implementations.
///
/// Returns the field names of `entry` that win against `stored`.
pub(crate) fn winning_fields<'a>(entry: &'a MergeEntry, stored: &FieldClocks) -> Vec<&'a str> {
    entry
        .clocks
        .fields
        .iter()
        .filter(|(field, incoming)| match stored.get(field) {
            Some(existing) => **incoming > *existing,
            None => true,
        })
        .map(|(field, _)| field.as_str())
        .collect()
}
