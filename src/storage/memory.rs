//! In-memory durable store.
//!
//! Backs tests and single-process demos. Carries failure injection
//! (`fail_next_writes` / `fail_next_reads`) and call counters so tests
//! can assert retry, rollback, and never-calls-the-store properties.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{winning_fields, ClockRow, DurableStore, MergeEntry, StoreError, StoredRow};
use crate::clock::FieldClocks;
use crate::object::ObjectPatch;

#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<(Uuid, Uuid), StoredRow>>,
    fail_writes: AtomicU32,
    fail_reads: AtomicU32,
    write_calls: AtomicU64,
    read_calls: AtomicU64,
    merge_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write calls fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` read calls fail with a transient error.
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn merge_calls(&self) -> u64 {
        self.merge_calls.load(Ordering::SeqCst)
    }

    /// Direct row access for test assertions.
    pub async fn row(&self, board_id: Uuid, object_id: Uuid) -> Option<StoredRow> {
        self.rows.read().await.get(&(board_id, object_id)).cloned()
    }

    pub async fn row_count(&self, board_id: Uuid) -> usize {
        self.rows
            .read()
            .await
            .keys()
            .filter(|(board, _)| *board == board_id)
            .count()
    }

    fn check_write(&self) -> Result<(), StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.fail_writes) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<(), StoreError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.fail_reads) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        Ok(())
    }
}

/// Decrement-if-positive; true when a failure was consumed.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn insert_object(&self, board_id: Uuid, row: StoredRow) -> Result<(), StoreError> {
        self.check_write()?;
        self.rows
            .write()
            .await
            .insert((board_id, row.object.id), row);
        Ok(())
    }

    async fn upsert_object(&self, board_id: Uuid, row: StoredRow) -> Result<(), StoreError> {
        self.check_write()?;
        self.rows
            .write()
            .await
            .insert((board_id, row.object.id), row);
        Ok(())
    }

    async fn update_fields(
        &self,
        board_id: Uuid,
        object_id: Uuid,
        patch: &ObjectPatch,
        clocks: &FieldClocks,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&(board_id, object_id))
            .ok_or(StoreError::NotFound(object_id))?;
        patch.apply_to(&mut row.object);
        row.clocks.overlay(clocks);
        Ok(())
    }

    async fn tombstone_objects(
        &self,
        board_id: Uuid,
        ids: &[Uuid],
        deleted_at: u64,
        clocks: &HashMap<Uuid, FieldClocks>,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        let mut rows = self.rows.write().await;
        for id in ids {
            if let Some(row) = rows.get_mut(&(board_id, *id)) {
                row.object.deleted_at = Some(deleted_at);
                if let Some(fragment) = clocks.get(id) {
                    row.clocks.overlay(fragment);
                }
            }
        }
        Ok(())
    }

    async fn delete_objects(&self, board_id: Uuid, ids: &[Uuid]) -> Result<(), StoreError> {
        self.check_write()?;
        let mut rows = self.rows.write().await;
        for id in ids {
            rows.remove(&(board_id, *id));
        }
        Ok(())
    }

    async fn fetch_board(
        &self,
        board_id: Uuid,
        max_rows: usize,
    ) -> Result<Vec<StoredRow>, StoreError> {
        self.check_read()?;
        let rows = self.rows.read().await;
        let mut out: Vec<StoredRow> = rows
            .iter()
            .filter(|((board, _), row)| *board == board_id && row.object.deleted_at.is_none())
            .map(|(_, row)| row.clone())
            .collect();
        // Deterministic order for the cap
        out.sort_by_key(|row| row.object.id);
        out.truncate(max_rows);
        Ok(out)
    }

    async fn fetch_clocks(&self, board_id: Uuid) -> Result<Vec<ClockRow>, StoreError> {
        self.check_read()?;
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|((board, _), _)| *board == board_id)
            .map(|((_, id), row)| ClockRow {
                object_id: *id,
                clocks: row.clocks.clone(),
            })
            .collect())
    }

    async fn merge_clock_wins(
        &self,
        board_id: Uuid,
        entries: Vec<MergeEntry>,
    ) -> Result<(), StoreError> {
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        let mut rows = self.rows.write().await;
        for entry in &entries {
            let Some(row) = rows.get_mut(&(board_id, entry.object_id)) else {
                log::debug!("Merge skipped unknown object {}", entry.object_id);
                continue;
            };
            let winners = winning_fields(entry, &row.clocks);
            if winners.is_empty() {
                continue;
            }
            entry.patch.project(&winners).apply_to(&mut row.object);
            for field in winners {
                if let Some(value) = entry.clocks.get(field) {
                    row.clocks.set(field, *value);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockValue, FieldClockStore};
    use crate::object::{fields, BoardObject, ObjectKind};

    fn row_for(board: Uuid, store: &mut FieldClockStore) -> StoredRow {
        let object = BoardObject::new(ObjectKind::Rect, board, 1.0, 2.0, store.client_id());
        let names = object.populated_fields();
        let clocks = store.stamp_create(object.id, &names);
        StoredRow { object, clocks }
    }

    #[tokio::test]
    async fn test_insert_fetch_roundtrip() {
        let store = MemoryStore::new();
        let board = Uuid::new_v4();
        let mut clocks = FieldClockStore::new(Uuid::new_v4());
        let row = row_for(board, &mut clocks);
        let id = row.object.id;

        store.insert_object(board, row).await.unwrap();
        let fetched = store.fetch_board(board, 100).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].object.id, id);
    }

    #[tokio::test]
    async fn test_tombstoned_rows_filtered_from_fetch() {
        let store = MemoryStore::new();
        let board = Uuid::new_v4();
        let mut clocks = FieldClockStore::new(Uuid::new_v4());
        let row = row_for(board, &mut clocks);
        let id = row.object.id;
        store.insert_object(board, row).await.unwrap();

        store
            .tombstone_objects(board, &[id], 123, &HashMap::new())
            .await
            .unwrap();
        assert!(store.fetch_board(board, 100).await.unwrap().is_empty());
        // But clocks are still visible for reconciliation
        assert_eq!(store.fetch_clocks(board).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_cap() {
        let store = MemoryStore::new();
        let board = Uuid::new_v4();
        let mut clocks = FieldClockStore::new(Uuid::new_v4());
        for _ in 0..10 {
            store
                .insert_object(board, row_for(board, &mut clocks))
                .await
                .unwrap();
        }
        assert_eq!(store.fetch_board(board, 4).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        let board = Uuid::new_v4();
        let mut clocks = FieldClockStore::new(Uuid::new_v4());

        store.fail_next_writes(2);
        assert!(store
            .insert_object(board, row_for(board, &mut clocks))
            .await
            .is_err());
        assert!(store
            .insert_object(board, row_for(board, &mut clocks))
            .await
            .is_err());
        assert!(store
            .insert_object(board, row_for(board, &mut clocks))
            .await
            .is_ok());
        assert_eq!(store.write_calls(), 3);
    }

    #[tokio::test]
    async fn test_merge_clock_wins_applies_only_newer() {
        let store = MemoryStore::new();
        let board = Uuid::new_v4();
        let client_a = Uuid::new_v4();
        let mut clocks_a = FieldClockStore::new(client_a);
        let row = row_for(board, &mut clocks_a);
        let id = row.object.id;
        let stored_x = *row.clocks.get(fields::X).unwrap();
        store.insert_object(board, row).await.unwrap();

        // A losing entry: clock older than the stored one
        let mut stale = FieldClocks::new();
        stale.set(
            fields::X,
            ClockValue {
                wall_ms: 0,
                counter: 0,
                client_id: client_a,
            },
        );
        store
            .merge_clock_wins(
                board,
                vec![MergeEntry {
                    object_id: id,
                    patch: ObjectPatch {
                        x: Some(555.0),
                        ..ObjectPatch::default()
                    },
                    clocks: stale,
                }],
            )
            .await
            .unwrap();
        let row = store.row(board, id).await.unwrap();
        assert_ne!(row.object.x, 555.0);
        assert_eq!(*row.clocks.get(fields::X).unwrap(), stored_x);

        // A winning entry: strictly newer clock
        let mut newer = FieldClocks::new();
        newer.set(
            fields::X,
            ClockValue {
                wall_ms: stored_x.wall_ms + 1000,
                counter: 0,
                client_id: client_a,
            },
        );
        store
            .merge_clock_wins(
                board,
                vec![MergeEntry {
                    object_id: id,
                    patch: ObjectPatch {
                        x: Some(777.0),
                        ..ObjectPatch::default()
                    },
                    clocks: newer,
                }],
            )
            .await
            .unwrap();
        assert_eq!(store.row(board, id).await.unwrap().object.x, 777.0);
    }

    #[tokio::test]
    async fn test_update_fields_missing_row() {
        let store = MemoryStore::new();
        let result = store
            .update_fields(
                Uuid::new_v4(),
                Uuid::new_v4(),
                &ObjectPatch::position(1.0, 1.0),
                &FieldClocks::new(),
            )
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_batch_delete() {
        let store = MemoryStore::new();
        let board = Uuid::new_v4();
        let mut clocks = FieldClockStore::new(Uuid::new_v4());
        let ids: Vec<Uuid> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                let row = row_for(board, &mut clocks);
                out.push(row.object.id);
                store.insert_object(board, row).await.unwrap();
            }
            out
        };
        store.delete_objects(board, &ids[..2]).await.unwrap();
        assert_eq!(store.row_count(board).await, 1);
    }
}
