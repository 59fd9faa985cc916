//! Durable per-file chunk storage.
//!
//! Each file id owns one [`FileRecord`] in the `file_chunks` tree of an embedded
//! sled database. Appends rewrite the whole record, so chunks always read back
//! in the order they were written.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const CHUNKS_TREE: &str = "file_chunks";
const META_TREE: &str = "meta";
const SCHEMA_KEY: &[u8] = b"schema_version";

/// Layout version written on first initialisation.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chunk store unavailable: {0}")]
    Unavailable(#[source] sled::Error),

    #[error("chunk store schema version {found} is newer than supported version {}", SCHEMA_VERSION)]
    UnsupportedSchema { found: u32 },

    #[error("failed to read chunk record: {0}")]
    ReadFailed(#[source] sled::Error),

    #[error("failed to write chunk record: {0}")]
    WriteFailed(#[source] sled::Error),

    #[error("no stored data for {0}")]
    NotFound(String),

    #[error("stored chunk record is corrupt: {0}")]
    Corrupt(#[from] postcard::Error),

    #[error("chunk store task aborted: {0}")]
    Background(#[from] tokio::task::JoinError),
}

/// Everything persisted for one file id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_id: String,
    pub chunks: Vec<Vec<u8>>,
    pub updated_at_ms: i64,
}

impl FileRecord {
    fn new(file_id: &str) -> Self {
        Self {
            file_id: file_id.to_string(),
            chunks: Vec::new(),
            updated_at_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn total_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }
}

/// Listing view of a record, without the chunk bytes.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RecordSummary {
    pub file_id: String,
    pub chunk_count: usize,
    pub total_bytes: u64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone)]
enum Location {
    Path(PathBuf),
    Temporary,
}

/// Lazily opened store. Every caller of [`ChunkStore::open`] shares one
/// initialisation; a failed initialisation is retried by the next caller.
pub struct ChunkStore {
    location: Location,
    handle: OnceCell<StoreHandle>,
    initializations: AtomicUsize,
}

impl ChunkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_location(Location::Path(path.into()))
    }

    /// A store that lives only as long as the process.
    pub fn temporary() -> Self {
        Self::with_location(Location::Temporary)
    }

    fn with_location(location: Location) -> Self {
        Self {
            location,
            handle: OnceCell::new(),
            initializations: AtomicUsize::new(0),
        }
    }

    pub async fn open(&self) -> Result<StoreHandle, StoreError> {
        self.handle
            .get_or_try_init(|| self.initialize())
            .await
            .cloned()
    }

    /// Number of times the underlying database was actually opened.
    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> Result<StoreHandle, StoreError> {
        let attempt = self.initializations.fetch_add(1, Ordering::SeqCst) + 1;
        let config = match &self.location {
            Location::Path(path) => sled::Config::new().path(path),
            Location::Temporary => sled::Config::new().temporary(true),
        };

        let handle = tokio::task::spawn_blocking(move || StoreHandle::initialize(config)).await??;
        info!(attempt, location = ?self.location, "chunk store opened");
        Ok(handle)
    }
}

/// Cheap, cloneable access to an opened store.
#[derive(Clone)]
pub struct StoreHandle {
    chunks: sled::Tree,
}

impl StoreHandle {
    fn initialize(config: sled::Config) -> Result<Self, StoreError> {
        let db = config.open().map_err(StoreError::Unavailable)?;
        let meta = db.open_tree(META_TREE).map_err(StoreError::Unavailable)?;

        match meta.get(SCHEMA_KEY).map_err(StoreError::ReadFailed)? {
            Some(raw) => {
                let found: u32 = postcard::from_bytes(&raw)?;
                if found > SCHEMA_VERSION {
                    return Err(StoreError::UnsupportedSchema { found });
                }
            }
            None => {
                let encoded = postcard::to_allocvec(&SCHEMA_VERSION)?;
                meta.insert(SCHEMA_KEY, encoded)
                    .map_err(StoreError::WriteFailed)?;
                meta.flush().map_err(StoreError::WriteFailed)?;
            }
        }

        let chunks = db.open_tree(CHUNKS_TREE).map_err(StoreError::Unavailable)?;
        Ok(Self { chunks })
    }

    /// Sum of all stored chunk lengths, or 0 when nothing is stored.
    pub async fn existing_length(&self, file_id: &str) -> Result<u64, StoreError> {
        Ok(self.load(file_id).await?.map_or(0, |record| record.total_len()))
    }

    /// Appends `bytes` as the new last chunk. Durable once this returns.
    pub async fn append_chunk(&self, file_id: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let tree = self.chunks.clone();
        let key = file_id.to_string();
        let len = bytes.len();

        let chunk_count = tokio::task::spawn_blocking(move || -> Result<usize, StoreError> {
            let mut record = read_record(&tree, &key)?.unwrap_or_else(|| FileRecord::new(&key));
            record.chunks.push(bytes);
            record.updated_at_ms = Utc::now().timestamp_millis();

            let encoded = postcard::to_allocvec(&record)?;
            tree.insert(key.as_bytes(), encoded)
                .map_err(StoreError::WriteFailed)?;
            Ok(record.chunks.len())
        })
        .await??;

        self.chunks
            .flush_async()
            .await
            .map_err(StoreError::WriteFailed)?;
        debug!(file_id, bytes = len, chunk_count, "chunk appended");
        Ok(())
    }

    pub async fn read_all_chunks(&self, file_id: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.load(file_id)
            .await?
            .map(|record| record.chunks)
            .ok_or_else(|| StoreError::NotFound(file_id.to_string()))
    }

    /// Removes the record. Succeeds whether or not it existed.
    pub async fn delete_record(&self, file_id: &str) -> Result<(), StoreError> {
        let tree = self.chunks.clone();
        let key = file_id.to_string();
        let existed = tokio::task::spawn_blocking(move || tree.remove(key.as_bytes()))
            .await?
            .map_err(StoreError::WriteFailed)?
            .is_some();

        self.chunks
            .flush_async()
            .await
            .map_err(StoreError::WriteFailed)?;
        debug!(file_id, existed, "record deleted");
        Ok(())
    }

    pub async fn records(&self) -> Result<Vec<RecordSummary>, StoreError> {
        let tree = self.chunks.clone();
        tokio::task::spawn_blocking(move || {
            let mut summaries = Vec::new();
            for entry in tree.iter() {
                let (_, raw) = entry.map_err(StoreError::ReadFailed)?;
                let record: FileRecord = postcard::from_bytes(&raw)?;
                summaries.push(RecordSummary {
                    chunk_count: record.chunks.len(),
                    total_bytes: record.total_len(),
                    updated_at_ms: record.updated_at_ms,
                    file_id: record.file_id,
                });
            }
            Ok(summaries)
        })
        .await?
    }

    async fn load(&self, file_id: &str) -> Result<Option<FileRecord>, StoreError> {
        let tree = self.chunks.clone();
        let key = file_id.to_string();
        tokio::task::spawn_blocking(move || read_record(&tree, &key)).await?
    }
}

fn read_record(tree: &sled::Tree, file_id: &str) -> Result<Option<FileRecord>, StoreError> {
    tree.get(file_id.as_bytes())
        .map_err(StoreError::ReadFailed)?
        .map(|raw| postcard::from_bytes(&raw).map_err(StoreError::from))
        .transpose()
}
