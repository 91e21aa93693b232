//! RocksDB-backed world snapshots.
//!
//! Column families:
//! - `worlds`  : full world subtrees as JSON (LZ4 compressed)
//! - `metadata`: per-world version and sizes (bincode)
//!
//! A snapshot and its metadata are always written in one batch.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

const CF_WORLDS: &str = "worlds";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_WORLDS, CF_METADATA];

#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tessera_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl PersistConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Stored alongside each world snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldMetadata {
    /// World root path
    pub root: String,
    /// Number of snapshots written for this world
    pub version: u64,
    /// Uncompressed JSON size in bytes
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl WorldMetadata {
    fn new(root: &str) -> Self {
        let now = now_secs();
        Self {
            root: root.to_string(),
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PersistError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(String),
    #[error("world not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for PersistError {
    fn from(e: rocksdb::Error) -> Self {
        PersistError::Database(e.to_string())
    }
}

pub struct SnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: PersistConfig,
}

impl SnapshotStore {
    /// Open (or create) the database at the configured path.
    pub fn open(config: PersistConfig) -> Result<Self, PersistError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &PersistConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Values are already LZ4 framed
            CF_WORLDS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    /// Save a world subtree, replacing any previous snapshot.
    pub fn save_world(&self, root: &str, world: &Value) -> Result<WorldMetadata, PersistError> {
        let cf_worlds = self.cf(CF_WORLDS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let json = serde_json::to_vec(world).map_err(|e| PersistError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut meta = match self.load_metadata(root) {
            Ok(meta) => meta,
            Err(PersistError::NotFound(_)) => WorldMetadata::new(root),
            Err(e) => return Err(e),
        };
        meta.version += 1;
        meta.snapshot_size = json.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_worlds, root.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, root.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(meta)
    }

    pub fn load_world(&self, root: &str) -> Result<Value, PersistError> {
        let cf = self.cf(CF_WORLDS)?;
        let compressed = self
            .db
            .get_cf(&cf, root.as_bytes())?
            .ok_or_else(|| PersistError::NotFound(root.to_string()))?;
        let json = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| PersistError::Compression(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| PersistError::Deserialization(e.to_string()))
    }

    pub fn world_exists(&self, root: &str) -> Result<bool, PersistError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, root.as_bytes())?.is_some())
    }

    /// Remove a world's snapshot and metadata. Missing worlds are not an error.
    pub fn delete_world(&self, root: &str) -> Result<(), PersistError> {
        let cf_worlds = self.cf(CF_WORLDS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_worlds, root.as_bytes());
        batch.delete_cf(&cf_meta, root.as_bytes());
        self.write(batch)
    }

    pub fn load_metadata(&self, root: &str) -> Result<WorldMetadata, PersistError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, root.as_bytes())? {
            Some(bytes) => WorldMetadata::decode(&bytes),
            None => Err(PersistError::NotFound(root.to_string())),
        }
    }

    /// All stored world roots, in key order.
    pub fn list_worlds(&self) -> Result<Vec<String>, PersistError> {
        let cf = self.cf(CF_METADATA)?;
        let mut roots = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let root = String::from_utf8(key.to_vec())
                .map_err(|e| PersistError::Deserialization(e.to_string()))?;
            roots.push(root);
        }
        Ok(roots)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), PersistError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write(&self, batch: WriteBatch) -> Result<(), PersistError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistError::Database(format!("Column family '{name}' not found")))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
