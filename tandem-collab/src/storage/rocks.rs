//! RocksDB-backed persistence adapter.
//!
//! Column families:
//! - `documents`  — JSON document snapshots, keyed by document id
//! - `operations` — JSON applied operations, keyed by `doc_id 0x00 version`
//!                  (big-endian version so iteration order is version order)
//!
//! Document ids are `[A-Za-z0-9_-]+`, so the 0x00 separator can never
//! collide with id bytes.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, MultiThreaded, Options, WriteOptions,
};
use std::path::PathBuf;

use tandem_ot::{DocumentId, Operation, Version};

use crate::storage::{Persistence, StoreError, StoredDocument};

const CF_DOCUMENTS: &str = "documents";
const CF_OPERATIONS: &str = "operations";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_OPERATIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: f64,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10.0,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests against a temp directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10.0,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

/// RocksDB-backed document store.
pub struct RocksStore {
    db: DBWithThreadMode<MultiThreaded>,
    write_opts: WriteOptions,
}

impl RocksStore {
    /// Open (creating if missing) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(4);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(config.sync_writes);

        Ok(Self { db, write_opts })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Point lookups of whole snapshots.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS => {
                // Many small appends, range-scanned per document.
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    fn op_key(id: &str, version: Version) -> Vec<u8> {
        let mut key = Vec::with_capacity(id.len() + 1 + 8);
        key.extend_from_slice(id.as_bytes());
        key.push(0);
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    fn op_prefix(id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(id.len() + 1);
        prefix.extend_from_slice(id.as_bytes());
        prefix.push(0);
        prefix
    }

    fn documents_cf(&self) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(CF_DOCUMENTS)
            .ok_or_else(|| StoreError::Database("missing documents column family".into()))
    }

    fn operations_cf(&self) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(CF_OPERATIONS)
            .ok_or_else(|| StoreError::Database("missing operations column family".into()))
    }
}

impl Persistence for RocksStore {
    fn save_document(&self, doc: &StoredDocument) -> Result<(), StoreError> {
        let cf = self.documents_cf()?;
        let encoded = serde_json::to_vec(doc)?;
        self.db
            .put_cf_opt(&cf, doc.id.as_bytes(), encoded, &self.write_opts)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn load_document(&self, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        let cf = self.documents_cf()?;
        let raw = self
            .db
            .get_cf(&cf, id.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_operation(&self, id: &str, version: Version, op: &Operation) -> Result<(), StoreError> {
        let cf = self.operations_cf()?;
        let encoded = serde_json::to_vec(op)?;
        self.db
            .put_cf_opt(&cf, Self::op_key(id, version), encoded, &self.write_opts)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn load_operations(&self, id: &str, since: Version) -> Result<Vec<Operation>, StoreError> {
        let cf = self.operations_cf()?;
        let prefix = Self::op_prefix(id);
        let start = Self::op_key(id, since.saturating_add(1));
        let mut ops = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            ops.push(serde_json::from_slice(&value)?);
        }
        Ok(ops)
    }

    fn delete_document(&self, id: &str) -> Result<(), StoreError> {
        let documents = self.documents_cf()?;
        self.db
            .delete_cf_opt(&documents, id.as_bytes(), &self.write_opts)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let operations = self.operations_cf()?;
        let prefix = Self::op_prefix(id);
        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(&operations, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            keys.push(key);
        }
        for key in keys {
            self.db
                .delete_cf_opt(&operations, key, &self.write_opts)
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.documents_cf()?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            match String::from_utf8(key.to_vec()) {
                Ok(id) => ids.push(id),
                Err(_) => log::warn!("skipping document with non-utf8 key"),
            }
        }
        Ok(ids)
    }
}
