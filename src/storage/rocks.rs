//! RocksDB-backed durable store.
//!
//! Column families:
//! - `objects` — full board-object rows (LZ4-compressed bincode),
//!   keyed by `<board_id:16><object_id:16>`
//! - `clocks`  — field-clock projections (bincode, uncompressed — small
//!   values, read hot during reconciliation), same key layout
//!
//! The 16-byte board prefix makes a board fetch a single forward scan.
//! Multi-row operations (tombstone sets, subtree deletes) go through an
//! atomic `WriteBatch`.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{winning_fields, ClockRow, DurableStore, MergeEntry, StoreError, StoredRow};
use crate::clock::FieldClocks;
use crate::object::ObjectPatch;

const CF_OBJECTS: &str = "objects";
const CF_CLOCKS: &str = "clocks";
const COLUMN_FAMILIES: &[&str] = &[CF_OBJECTS, CF_CLOCKS];

type Db = DBWithThreadMode<MultiThreaded>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksStoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for RocksStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("boardsync_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl RocksStoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

/// RocksDB-backed board object store.
pub struct RocksStore {
    db: Db,
    config: RocksStoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: RocksStoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &RocksStoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        // Board fetches are forward scans over the 16-byte board prefix
        opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));

        match name {
            CF_OBJECTS => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            CF_CLOCKS => {
                // Small values read hot during reconciliation
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    /// Build a row key: board_id (16 bytes) + object_id (16 bytes).
    fn row_key(board_id: Uuid, object_id: Uuid) -> [u8; 32] {
        let mut key = [0u8; 32];
        key[..16].copy_from_slice(board_id.as_bytes());
        key[16..].copy_from_slice(object_id.as_bytes());
        key
    }

    fn encode_row(row: &StoredRow) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(row, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode_row(bytes: &[u8]) -> Result<StoredRow, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (row, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(row)
    }

    fn encode_clocks(clocks: &FieldClocks) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(clocks, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode_clocks(bytes: &[u8]) -> Result<FieldClocks, StoreError> {
        let (clocks, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(clocks)
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// Write a full row (object + clocks) atomically.
    fn put_row(&self, board_id: Uuid, row: &StoredRow) -> Result<(), StoreError> {
        let cf_objects = self.cf(CF_OBJECTS)?;
        let cf_clocks = self.cf(CF_CLOCKS)?;
        let key = Self::row_key(board_id, row.object.id);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_objects, key, Self::encode_row(row)?);
        batch.put_cf(&cf_clocks, key, Self::encode_clocks(&row.clocks)?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn get_row(&self, board_id: Uuid, object_id: Uuid) -> Result<Option<StoredRow>, StoreError> {
        let cf = self.cf(CF_OBJECTS)?;
        let key = Self::row_key(board_id, object_id);
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => Ok(Some(Self::decode_row(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DurableStore for RocksStore {
    async fn insert_object(&self, board_id: Uuid, row: StoredRow) -> Result<(), StoreError> {
        self.put_row(board_id, &row)
    }

    async fn upsert_object(&self, board_id: Uuid, row: StoredRow) -> Result<(), StoreError> {
        self.put_row(board_id, &row)
    }

    async fn update_fields(
        &self,
        board_id: Uuid,
        object_id: Uuid,
        patch: &ObjectPatch,
        clocks: &FieldClocks,
    ) -> Result<(), StoreError> {
        let mut row = self
            .get_row(board_id, object_id)?
            .ok_or(StoreError::NotFound(object_id))?;
        patch.apply_to(&mut row.object);
        row.clocks.overlay(clocks);
        self.put_row(board_id, &row)
    }

    async fn tombstone_objects(
        &self,
        board_id: Uuid,
        ids: &[Uuid],
        deleted_at: u64,
        clocks: &HashMap<Uuid, FieldClocks>,
    ) -> Result<(), StoreError> {
        let cf_objects = self.cf(CF_OBJECTS)?;
        let cf_clocks = self.cf(CF_CLOCKS)?;

        let mut batch = WriteBatch::default();
        for id in ids {
            let Some(mut row) = self.get_row(board_id, *id)? else {
                continue;
            };
            row.object.deleted_at = Some(deleted_at);
            if let Some(fragment) = clocks.get(id) {
                row.clocks.overlay(fragment);
            }
            let key = Self::row_key(board_id, *id);
            batch.put_cf(&cf_objects, key, Self::encode_row(&row)?);
            batch.put_cf(&cf_clocks, key, Self::encode_clocks(&row.clocks)?);
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    async fn delete_objects(&self, board_id: Uuid, ids: &[Uuid]) -> Result<(), StoreError> {
        let cf_objects = self.cf(CF_OBJECTS)?;
        let cf_clocks = self.cf(CF_CLOCKS)?;

        let mut batch = WriteBatch::default();
        for id in ids {
            let key = Self::row_key(board_id, *id);
            batch.delete_cf(&cf_objects, key);
            batch.delete_cf(&cf_clocks, key);
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    async fn fetch_board(
        &self,
        board_id: Uuid,
        max_rows: usize,
    ) -> Result<Vec<StoredRow>, StoreError> {
        let cf = self.cf(CF_OBJECTS)?;
        let prefix = board_id.as_bytes();

        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 32 || &key[..16] != prefix.as_slice() {
                break;
            }
            let row = Self::decode_row(&value)?;
            if row.object.deleted_at.is_some() {
                continue;
            }
            if rows.len() >= max_rows {
                log::warn!("Board {board_id} fetch truncated at {max_rows} rows");
                break;
            }
            rows.push(row);
        }
        Ok(rows)
    }

    async fn fetch_clocks(&self, board_id: Uuid) -> Result<Vec<ClockRow>, StoreError> {
        let cf = self.cf(CF_CLOCKS)?;
        let prefix = board_id.as_bytes();

        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 32 || &key[..16] != prefix.as_slice() {
                break;
            }
            let object_id = Uuid::from_bytes(
                key[16..32]
                    .try_into()
                    .map_err(|_| StoreError::Deserialization("Invalid UUID key".into()))?,
            );
            out.push(ClockRow {
                object_id,
                clocks: Self::decode_clocks(&value)?,
            });
        }
        Ok(out)
    }

    async fn merge_clock_wins(
        &self,
        board_id: Uuid,
        entries: Vec<MergeEntry>,
    ) -> Result<(), StoreError> {
        let cf_objects = self.cf(CF_OBJECTS)?;
        let cf_clocks = self.cf(CF_CLOCKS)?;

        let mut batch = WriteBatch::default();
        for entry in &entries {
            let Some(mut row) = self.get_row(board_id, entry.object_id)? else {
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
            let key = Self::row_key(board_id, entry.object_id);
            batch.put_cf(&cf_objects, key, Self::encode_row(&row)?);
            batch.put_cf(&cf_clocks, key, Self::encode_clocks(&row.clocks)?);
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }
}
