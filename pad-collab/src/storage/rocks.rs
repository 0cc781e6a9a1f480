//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: `{text, commits}` per document id (bincode, LZ4 compressed)
//! - `metadata` : per document name: id, last-written stamp, sizes
//! - `replica`  : `checkpoint` → log position the stored documents reflect
//!
//! A flush is one batch (bodies + metadata + checkpoint), so a crash leaves
//! either the old or the new image of all of them, never a mix.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use pad_core::{Commit, DocumentId, DocumentSnapshot};
use pad_paxos::Seq;

use crate::op::{AppliedPut, OperationId};

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const CF_REPLICA: &str = "replica";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA, CF_REPLICA];

const CHECKPOINT_KEY: &[u8] = b"checkpoint";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, given directory.
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

    /// Defaults rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Per-document metadata, keyed by document name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub id: DocumentId,
    pub name: String,
    /// Write stamp of the last applied put
    pub last_written: Option<u64>,
    /// Index of the newest commit
    pub head: usize,
    /// Uncompressed body size in bytes
    pub body_size: u64,
    /// Compressed body size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch of the last save
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        encode(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        decode(bytes)
    }
}

/// Log position the stored documents reflect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaCheckpoint {
    /// Entry in slot 0 of the log these slots belong to
    pub log_id: Option<OperationId>,
    /// Last slot whose effects are in the stored documents
    pub last_applied: Option<Seq>,
    /// Duplicate filter as of `last_applied`
    pub recent: Vec<AppliedPut>,
}

#[derive(Serialize)]
struct BodyRef<'a> {
    text: &'a str,
    commits: &'a [Commit],
}

#[derive(Deserialize)]
struct Body {
    text: String,
    commits: Vec<Commit>,
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("Column family '{0}' not found")]
    MissingColumnFamily(&'static str),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode; callers share it through an Arc)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Document store opened at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Bodies are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_METADATA | CF_REPLICA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Write a document image (body + metadata in one batch).
    pub fn save_document(&self, doc: &DocumentSnapshot) -> Result<DocumentMetadata, StoreError> {
        let mut batch = WriteBatch::default();
        let meta = self.stage_document(&mut batch, doc)?;
        self.write(batch)?;
        Ok(meta)
    }

    /// Write `docs` and, if given, the checkpoint they reflect, atomically.
    pub fn save(
        &self,
        docs: &[DocumentSnapshot],
        checkpoint: Option<&ReplicaCheckpoint>,
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for doc in docs {
            self.stage_document(&mut batch, doc)?;
        }
        if let Some(checkpoint) = checkpoint {
            batch.put_cf(self.cf(CF_REPLICA)?, CHECKPOINT_KEY, encode(checkpoint)?);
        }
        self.write(batch)?;
        log::trace!(
            "Saved {} documents (checkpoint at {:?})",
            docs.len(),
            checkpoint.and_then(|c| c.last_applied)
        );
        Ok(())
    }

    /// Stored checkpoint, if any flush has written one.
    pub fn load_checkpoint(&self) -> Result<Option<ReplicaCheckpoint>, StoreError> {
        match self.db.get_cf(self.cf(CF_REPLICA)?, CHECKPOINT_KEY)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn stage_document(
        &self,
        batch: &mut WriteBatch,
        doc: &DocumentSnapshot,
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let body = encode(&BodyRef {
            text: &doc.text,
            commits: &doc.commits,
        })?;
        let compressed = lz4_flex::compress_prepend_size(&body);

        let meta = DocumentMetadata {
            id: doc.id,
            name: doc.name.clone(),
            last_written: doc.last_written,
            head: doc.head(),
            body_size: body.len() as u64,
            compressed_size: compressed.len() as u64,
            updated_at: now_secs(),
        };

        // A name re-bound to a new id leaves no orphaned body behind.
        if let Some(previous) = self.metadata(&doc.name)? {
            if previous.id != doc.id {
                batch.delete_cf(cf_docs, previous.id.to_be_bytes());
            }
        }
        batch.put_cf(cf_docs, doc.id.to_be_bytes(), &compressed);
        batch.put_cf(cf_meta, doc.name.as_bytes(), meta.encode()?);

        log::trace!(
            "Staged '{}' (head {}, {} → {} bytes)",
            doc.name,
            meta.head,
            meta.body_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Load the stored image of `name`.
    pub fn load_document(&self, name: &str) -> Result<DocumentSnapshot, StoreError> {
        let meta = self
            .metadata(name)?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        self.load_body(meta)
    }

    fn load_body(&self, meta: DocumentMetadata) -> Result<DocumentSnapshot, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = self
            .db
            .get_cf(cf, meta.id.to_be_bytes())?
            .ok_or_else(|| StoreError::NotFound(meta.name.clone()))?;
        let body = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let Body { text, commits } = decode(&body)?;
        Ok(DocumentSnapshot {
            id: meta.id,
            name: meta.name,
            text,
            last_written: meta.last_written,
            commits,
        })
    }

    /// Metadata of `name`, if stored.
    pub fn metadata(&self, name: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, name.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Metadata of every stored document, ordered by name.
    pub fn list_documents(&self) -> Result<Vec<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut docs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            docs.push(DocumentMetadata::decode(&value)?);
        }
        Ok(docs)
    }

    /// Every stored document image.
    pub fn load_all(&self) -> Result<Vec<DocumentSnapshot>, StoreError> {
        self.list_documents()?
            .into_iter()
            .map(|meta| self.load_body(meta))
            .collect()
    }

    /// Remove `name` and its body. Missing documents are not an error.
    pub fn delete_document(&self, name: &str) -> Result<(), StoreError> {
        let Some(meta) = self.metadata(name)? else {
            return Ok(());
        };
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, meta.id.to_be_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, name.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }
}
