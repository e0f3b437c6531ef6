//! Upload record store
//!
//! Keyed storage for [`UploadRecord`]s. Progress is only ever written through
//! [`UploadStore::commit`], a compare-and-swap on the stored offset, so a
//! writer that raced another writer for the same offset fails instead of
//! overwriting its progress.

use super::{BusinessMeta, UploadRecord};
use crate::tus::metadata::UploadMetadata;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Record store errors
#[derive(Error, Debug, PartialEq)]
pub enum StoreError {
    #[error("Upload id already exists: {0}")]
    AlreadyExists(String),

    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Offset conflict for upload {upload_id}: expected {expected}, stored {actual}")]
    OffsetConflict {
        upload_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("{0}")]
    Backend(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Backend(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(format!("Invalid record: {}", err))
    }
}

/// Fields a successful chunk write advances together
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub offset: u64,
    pub finished: bool,
    pub business_meta: BusinessMeta,
}

/// Durable keyed storage for upload records
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Insert a fresh record at offset 0; fails if the id exists
    async fn insert(
        &self,
        upload_id: &str,
        total_size: u64,
        upload_meta: UploadMetadata,
        business_meta: BusinessMeta,
    ) -> Result<UploadRecord, StoreError>;

    async fn get(&self, upload_id: &str) -> Result<Option<UploadRecord>, StoreError>;

    /// Apply `update` only if the stored offset still equals `expected_offset`
    async fn commit(
        &self,
        upload_id: &str,
        expected_offset: u64,
        update: RecordUpdate,
    ) -> Result<UploadRecord, StoreError>;

    /// Remove a record, returning it
    async fn remove(&self, upload_id: &str) -> Result<UploadRecord, StoreError>;
}

/// Concurrent in-process record store
#[derive(Default)]
pub struct MemoryUploadStore {
    records: DashMap<String, UploadRecord>,
    next_id: AtomicU64,
}

impl MemoryUploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl UploadStore for MemoryUploadStore {
    async fn insert(
        &self,
        upload_id: &str,
        total_size: u64,
        upload_meta: UploadMetadata,
        business_meta: BusinessMeta,
    ) -> Result<UploadRecord, StoreError> {
        match self.records.entry(upload_id.to_string()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(upload_id.to_string())),
            Entry::Vacant(slot) => {
                let now = Utc::now();
                let record = UploadRecord {
                    record_id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
                    upload_id: upload_id.to_string(),
                    total_size,
                    offset: 0,
                    upload_meta,
                    business_meta,
                    finished: false,
                    create_time: now,
                    update_time: now,
                };
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn get(&self, upload_id: &str) -> Result<Option<UploadRecord>, StoreError> {
        Ok(self.records.get(upload_id).map(|r| r.value().clone()))
    }

    async fn commit(
        &self,
        upload_id: &str,
        expected_offset: u64,
        update: RecordUpdate,
    ) -> Result<UploadRecord, StoreError> {
        let mut record = self
            .records
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::NotFound(upload_id.to_string()))?;

        if record.offset != expected_offset || update.offset < record.offset {
            return Err(StoreError::OffsetConflict {
                upload_id: upload_id.to_string(),
                expected: expected_offset,
                actual: record.offset,
            });
        }

        record.offset = update.offset;
        record.finished = update.finished;
        record.business_meta = update.business_meta;
        record.update_time = Utc::now();

        Ok(record.clone())
    }

    async fn remove(&self, upload_id: &str) -> Result<UploadRecord, StoreError> {
        self.records
            .remove(upload_id)
            .map(|(_, record)| record)
            .ok_or_else(|| StoreError::NotFound(upload_id.to_string()))
    }
}
