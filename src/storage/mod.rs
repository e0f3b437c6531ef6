//! Storage backends
//!
//! Upload records and the contract the protocol engine drives. Each backend
//! owns an [`UploadStore`] for its records and a set of per-upload locks, so
//! that "read offset, write bytes, advance offset" runs as one critical
//! section per upload id while different uploads proceed independently.
//!
//! | Backend | Medium | Finalization |
//! |---------|--------|--------------|
//! | [`LocalBackend`] | temp file, offset-addressed writes | atomic rename |
//! | [`ObjectBackend`] | S3 PutObject or multipart session | CompleteMultipartUpload |

use crate::s3::S3ClientError;
use crate::tus::metadata::UploadMetadata;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub mod file_store;
pub mod local;
pub mod object;
pub mod store;

pub use file_store::FileUploadStore;
pub use local::LocalBackend;
pub use object::ObjectBackend;
pub use store::{MemoryUploadStore, RecordUpdate, StoreError, UploadStore};

/// Chunk body as delivered by the HTTP layer
pub type ChunkStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Wrap in-memory bytes as a single-item chunk stream
pub fn chunk_from_bytes(data: impl Into<Bytes>) -> ChunkStream {
    let data: Bytes = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Upload id already exists: {0}")]
    AlreadyExists(String),

    #[error("Offset conflict for upload {upload_id}: expected {expected}, stored {actual}")]
    OffsetConflict {
        upload_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Business meta type mismatch for upload {0}")]
    MetaMismatch(String),

    #[error("Destination does not exist: {0}")]
    DestinationMissing(String),

    #[error("Destination already exists: {0}")]
    DestinationExists(String),

    #[error("Upload data missing: {0}")]
    DataMissing(String),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] S3ClientError),

    #[error("Record store error: {0}")]
    RecordStore(String),
}

impl From<StoreError> for StorageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(id) => StorageError::AlreadyExists(id),
            StoreError::NotFound(id) => StorageError::NotFound(id),
            StoreError::OffsetConflict {
                upload_id,
                expected,
                actual,
            } => StorageError::OffsetConflict {
                upload_id,
                expected,
                actual,
            },
            StoreError::Backend(message) => StorageError::RecordStore(message),
        }
    }
}

/// One resumable upload session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub record_id: u64,
    pub upload_id: String,
    pub total_size: u64,
    pub offset: u64,
    pub upload_meta: UploadMetadata,
    pub business_meta: BusinessMeta,
    pub finished: bool,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl UploadRecord {
    /// Bytes still expected before the upload is complete
    pub fn remaining(&self) -> u64 {
        self.total_size - self.offset
    }

    /// Original client filename, if supplied
    pub fn filename(&self) -> Option<&str> {
        self.upload_meta.get("filename").and_then(|v| v.as_deref())
    }
}

/// Backend-specific record fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusinessMeta {
    Local(LocalMeta),
    Object(ObjectMeta),
}

/// Local file placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalMeta {
    pub dir_path: PathBuf,
    /// Name after finalization
    pub write_file_name: String,
    /// Name while in progress
    pub tmp_name: String,
}

impl LocalMeta {
    pub fn tmp_path(&self) -> PathBuf {
        self.dir_path.join(&self.tmp_name)
    }

    pub fn final_path(&self) -> PathBuf {
        self.dir_path.join(&self.write_file_name)
    }
}

/// Object placement and multipart progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub bucket: String,
    pub object_name: String,
    #[serde(default)]
    pub multipart: Option<MultipartState>,
}

/// Open multipart session, recorded once the first part-sized chunk arrives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipartState {
    pub remote_session_id: String,
    pub part_size: u64,
    pub part_count: u32,
    pub parts: Vec<UploadedPart>,
    /// Set once every part is uploaded and completion has been requested
    #[serde(default)]
    pub completing: bool,
}

/// Part acknowledged by the object store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Storage backend contract
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persist a new record at offset 0
    async fn create(
        &self,
        upload_id: &str,
        total_size: u64,
        upload_meta: UploadMetadata,
        business_meta: BusinessMeta,
    ) -> Result<UploadRecord, StorageError>;

    /// Look up a record
    async fn get(&self, upload_id: &str) -> Result<Option<UploadRecord>, StorageError>;

    /// Write exactly `size` bytes at `offset` and advance the record
    async fn write_chunk(
        &self,
        upload_id: &str,
        offset: u64,
        size: u64,
        body: ChunkStream,
    ) -> Result<UploadRecord, StorageError>;

    /// Release backend resources and remove the record
    async fn delete(&self, upload_id: &str) -> Result<(), StorageError>;
}

/// Per-upload mutual exclusion
#[derive(Default)]
pub struct UploadLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UploadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `upload_id`
    pub async fn acquire(&self, upload_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(upload_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the lock entry of a removed or finished upload
    pub fn release(&self, upload_id: &str) {
        self.locks.remove(upload_id);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Check that a write targets the stored offset and fits the upload
pub(crate) fn check_chunk(record: &UploadRecord, offset: u64, size: u64) -> Result<(), StorageError> {
    if record.offset != offset {
        return Err(StorageError::OffsetConflict {
            upload_id: record.upload_id.clone(),
            expected: offset,
            actual: record.offset,
        });
    }
    if size == 0 || size > record.remaining() {
        return Err(StorageError::InvalidChunk(format!(
            "chunk of {} bytes at offset {} does not fit upload of {} bytes",
            size, offset, record.total_size
        )));
    }
    Ok(())
}

/// Drain a chunk body into memory, requiring exactly `size` bytes
pub(crate) async fn read_chunk(mut body: ChunkStream, size: u64) -> Result<Bytes, StorageError> {
    let mut buffer = BytesMut::with_capacity(size as usize);

    while let Some(piece) = body.next().await {
        let piece = piece?;
        if buffer.len() as u64 + piece.len() as u64 > size {
            return Err(StorageError::InvalidChunk(format!(
                "body is longer than the declared {} bytes",
                size
            )));
        }
        buffer.extend_from_slice(&piece);
    }

    if (buffer.len() as u64) < size {
        return Err(StorageError::InvalidChunk(format!(
            "body ended after {} of {} bytes",
            buffer.len(),
            size
        )));
    }

    Ok(buffer.freeze())
}
