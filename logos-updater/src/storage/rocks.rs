//! RocksDB-backed versioned store.
//!
//! Column families:
//! - `docs`     — Document body: lines + ranges as LZ4-compressed JSON
//! - `metadata` — Version, pathname, content hash, timestamps (bincode)
//!
//! Keys are `project_id (16 bytes) ++ doc_id (16 bytes)`, so a project's docs
//! are contiguous and can be prefix-scanned.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::collaborators::{CollaboratorError, DocumentSnapshot, StoredDocument, VersionedStore};
use crate::document::content_hash;
use crate::ranges::Ranges;
use crate::update::now_millis;

/// Column family names.
const CF_DOCS: &str = "docs";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true; flushes are the durability point)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("updater_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Stale write: stored v{stored}, attempted v{attempted}")]
    StaleWrite { stored: u64, attempted: u64 },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for CollaboratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::StaleWrite { .. } => CollaboratorError::Conflict,
            StoreError::Deserialization(reason) | StoreError::Compression(reason) => {
                CollaboratorError::Integrity(reason)
            }
            other => CollaboratorError::Unavailable(other.to_string()),
        }
    }
}

/// Per-document record in the `metadata` column family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocRecord {
    pub version: u64,
    pub pathname: String,
    pub project_history_id: Option<String>,
    /// SHA-256 of the JSON lines written with this version
    pub content_hash: String,
    /// Body moved to the archive; `docs` holds nothing for this key
    pub archived: bool,
    pub last_updated_at: Option<u64>,
    pub last_updated_by: Option<String>,
    /// Uncompressed / compressed body sizes
    pub body_size: u64,
    pub compressed_size: u64,
    /// Milliseconds since epoch
    pub updated_at: u64,
}

impl DocRecord {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

/// Document body in the `docs` column family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DocBody {
    lines: Vec<String>,
    #[serde(default)]
    ranges: Ranges,
}

impl DocBody {
    // JSON rather than bincode: ranges contain untagged ops.
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let json = serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&json))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let json = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

/// Build a document key: project_id (16 bytes) + doc_id (16 bytes).
pub fn doc_key(project_id: Uuid, doc_id: Uuid) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(project_id.as_bytes());
    key[16..].copy_from_slice(doc_id.as_bytes());
    key
}

/// RocksDB-backed versioned document store.
///
/// Writes are atomic batches of body + record. A write carrying a lower
/// version than the stored one is rejected as a conflict; an equal version is
/// accepted so retries stay idempotent.
pub struct RocksVersionedStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksVersionedStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
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
        log::info!("Opened versioned store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            CF_DOCS => {
                // Bodies are LZ4-compressed already
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                // Small values, prefix-scanned by project
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Insert or replace a document outright (used for seeding and imports).
    pub fn create_document(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        lines: Vec<String>,
        pathname: impl Into<String>,
    ) -> Result<DocRecord, StoreError> {
        let body = DocBody {
            lines,
            ranges: Ranges::default(),
        };
        let record = DocRecord {
            version: 0,
            pathname: pathname.into(),
            project_history_id: None,
            content_hash: content_hash(&body.lines),
            archived: false,
            last_updated_at: None,
            last_updated_by: None,
            body_size: 0,
            compressed_size: 0,
            updated_at: now_millis(),
        };
        self.write(project_id, doc_id, &body, record)
    }

    /// Load a document. `Ok(None)` if it does not exist.
    pub fn load(&self, project_id: Uuid, doc_id: Uuid) -> Result<Option<StoredDocument>, StoreError> {
        let Some(record) = self.load_record(project_id, doc_id)? else {
            return Ok(None);
        };
        let key = doc_key(project_id, doc_id);

        let body = if record.archived {
            None
        } else {
            let cf = self.cf(CF_DOCS)?;
            match self.db.get_cf(cf, key)? {
                Some(bytes) => Some(DocBody::decode(&bytes)?),
                None => {
                    return Err(StoreError::Deserialization(format!(
                        "metadata present but body missing for doc {doc_id}"
                    )))
                }
            }
        };

        let (lines, ranges) = match body {
            Some(body) => (Some(body.lines), body.ranges),
            None => (None, Ranges::default()),
        };
        Ok(Some(StoredDocument {
            lines,
            version: record.version,
            ranges,
            pathname: record.pathname,
            project_history_id: record.project_history_id,
            content_hash: Some(record.content_hash),
        }))
    }

    /// Write a flushed snapshot, rejecting versions older than the stored one.
    pub fn save(&self, project_id: Uuid, doc_id: Uuid, snapshot: &DocumentSnapshot) -> Result<DocRecord, StoreError> {
        let existing = self.load_record(project_id, doc_id)?;
        if let Some(existing) = &existing {
            if snapshot.version < existing.version {
                return Err(StoreError::StaleWrite {
                    stored: existing.version,
                    attempted: snapshot.version,
                });
            }
        }

        let (pathname, project_history_id) = existing
            .map(|r| (r.pathname, r.project_history_id))
            .unwrap_or_default();
        let body = DocBody {
            lines: snapshot.lines.clone(),
            ranges: snapshot.ranges.clone(),
        };
        let record = DocRecord {
            version: snapshot.version,
            pathname,
            project_history_id,
            content_hash: content_hash(&body.lines),
            archived: false,
            last_updated_at: snapshot.last_updated_at,
            last_updated_by: snapshot.last_updated_by.clone(),
            body_size: 0,
            compressed_size: 0,
            updated_at: now_millis(),
        };
        self.write(project_id, doc_id, &body, record)
    }

    /// Drop a document's body and mark it archived.
    pub fn mark_archived(&self, project_id: Uuid, doc_id: Uuid) -> Result<bool, StoreError> {
        let Some(mut record) = self.load_record(project_id, doc_id)? else {
            return Ok(false);
        };
        record.archived = true;
        record.updated_at = now_millis();

        let key = doc_key(project_id, doc_id);
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCS)?, key);
        batch.put_cf(self.cf(CF_METADATA)?, key, record.encode()?);
        self.commit(batch)?;
        Ok(true)
    }

    pub fn set_pathname(&self, project_id: Uuid, doc_id: Uuid, pathname: &str) -> Result<bool, StoreError> {
        let Some(mut record) = self.load_record(project_id, doc_id)? else {
            return Ok(false);
        };
        record.pathname = pathname.to_string();
        self.db
            .put_cf(self.cf(CF_METADATA)?, doc_key(project_id, doc_id), record.encode()?)?;
        Ok(true)
    }

    pub fn delete_document(&self, project_id: Uuid, doc_id: Uuid) -> Result<(), StoreError> {
        let key = doc_key(project_id, doc_id);
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCS)?, key);
        batch.delete_cf(self.cf(CF_METADATA)?, key);
        self.commit(batch)
    }

    pub fn load_record(&self, project_id: Uuid, doc_id: Uuid) -> Result<Option<DocRecord>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_key(project_id, doc_id))? {
            Some(bytes) => Ok(Some(DocRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every doc id stored for a project.
    pub fn list_documents(&self, project_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let prefix = project_id.as_bytes();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut docs = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if key.len() != 32 || &key[..16] != prefix {
                break;
            }
            let mut id = [0u8; 16];
            id.copy_from_slice(&key[16..]);
            docs.push(Uuid::from_bytes(id));
        }
        Ok(docs)
    }

    /// Force a memtable flush to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        body: &DocBody,
        mut record: DocRecord,
    ) -> Result<DocRecord, StoreError> {
        let compressed = body.encode()?;
        record.body_size = body.lines.iter().map(|l| l.len() as u64 + 1).sum();
        record.compressed_size = compressed.len() as u64;

        // Atomic batch write: body + record
        let key = doc_key(project_id, doc_id);
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCS)?, key, &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, key, record.encode()?);
        self.commit(batch)?;

        log::debug!("Stored doc {doc_id} at v{} ({} bytes compressed)", record.version, compressed.len());
        Ok(record)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl VersionedStore for RocksVersionedStore {
    async fn get_document(&self, project_id: Uuid, doc_id: Uuid) -> Result<StoredDocument, CollaboratorError> {
        self.load(project_id, doc_id)?.ok_or(CollaboratorError::NotFound)
    }

    async fn set_document(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        snapshot: &DocumentSnapshot,
    ) -> Result<(), CollaboratorError> {
        self.save(project_id, doc_id, snapshot)?;
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
