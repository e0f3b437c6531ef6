//! File-backed upload record store
//!
//! One JSON document per upload, `{dir}/{upload_id}.json`. Updates are
//! written to `{upload_id}.json.tmp`, synced, then renamed over the record,
//! so a crash leaves either the previous or the next version on disk.
//! Records survive restarts, which keeps open multipart sessions and
//! temp files reachable for resumption and deletion.

use super::store::{RecordUpdate, StoreError, UploadStore};
use super::{BusinessMeta, UploadLocks, UploadRecord};
use crate::tus::metadata::UploadMetadata;
use async_trait::async_trait;
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const RECORD_EXT: &str = "json";
const PENDING_EXT: &str = "json.tmp";

/// Durable record store on the local filesystem
pub struct FileUploadStore {
    dir: PathBuf,
    locks: UploadLocks,
    next_id: AtomicU64,
}

impl FileUploadStore {
    /// Open (creating if needed) a record directory
    ///
    /// Half-written updates from an interrupted process are discarded and
    /// record ids continue after the highest one found.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut last_id = 0;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json.tmp") {
                remove_if_present(&path).await?;
            } else if name.ends_with(".json") {
                if let Some(record) = read_record(&path).await? {
                    last_id = last_id.max(record.record_id);
                }
            }
        }

        tracing::info!(dir = %dir.display(), last_record_id = last_id, "Record store opened");
        Ok(Self {
            dir,
            locks: UploadLocks::new(),
            next_id: AtomicU64::new(last_id),
        })
    }

    /// Record path, or `None` for ids that cannot name a file in `dir`
    fn record_path(&self, upload_id: &str) -> Option<PathBuf> {
        let usable = !upload_id.is_empty()
            && upload_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        usable.then(|| self.dir.join(format!("{}.{}", upload_id, RECORD_EXT)))
    }

    fn existing_path(&self, upload_id: &str) -> Result<PathBuf, StoreError> {
        self.record_path(upload_id)
            .ok_or_else(|| StoreError::NotFound(upload_id.to_string()))
    }

    async fn persist(&self, path: &Path, record: &UploadRecord) -> Result<(), StoreError> {
        let pending = path.with_extension(PENDING_EXT);
        let data = serde_json::to_vec_pretty(record)?;

        let mut file = fs::File::create(&pending).await?;
        file.write_all(&data).await?;
        file.sync_data().await?;
        drop(file);

        fs::rename(&pending, path).await?;
        Ok(())
    }
}

async fn read_record(path: &Path) -> Result<Option<UploadRecord>, StoreError> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl UploadStore for FileUploadStore {
    async fn insert(
        &self,
        upload_id: &str,
        total_size: u64,
        upload_meta: UploadMetadata,
        business_meta: BusinessMeta,
    ) -> Result<UploadRecord, StoreError> {
        let path = self
            .record_path(upload_id)
            .ok_or_else(|| StoreError::Backend(format!("Unusable upload id: {}", upload_id)))?;
        let _guard = self.locks.acquire(upload_id).await;

        if fs::try_exists(&path).await? {
            return Err(StoreError::AlreadyExists(upload_id.to_string()));
        }

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
        self.persist(&path, &record).await?;
        Ok(record)
    }

    async fn get(&self, upload_id: &str) -> Result<Option<UploadRecord>, StoreError> {
        match self.record_path(upload_id) {
            Some(path) => read_record(&path).await,
            None => Ok(None),
        }
    }

    async fn commit(
        &self,
        upload_id: &str,
        expected_offset: u64,
        update: RecordUpdate,
    ) -> Result<UploadRecord, StoreError> {
        let path = self.existing_path(upload_id)?;
        let _guard = self.locks.acquire(upload_id).await;

        let mut record = read_record(&path)
            .await?
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
        self.persist(&path, &record).await?;

        if record.finished {
            self.locks.release(upload_id);
        }
        Ok(record)
    }

    async fn remove(&self, upload_id: &str) -> Result<UploadRecord, StoreError> {
        let path = self.existing_path(upload_id)?;
        let _guard = self.locks.acquire(upload_id).await;

        let record = read_record(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(upload_id.to_string()))?;
        fs::remove_file(&path).await?;
        self.locks.release(upload_id);
        Ok(record)
    }
}
