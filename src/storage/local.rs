//! Local file backend
//!
//! Chunks are written in place into `dir_path/tmp_name` at their offset. The
//! completing chunk renames the temp file to `dir_path/write_file_name`, so a
//! file under its final name is always complete.
//!
//! Only a chunk at offset 0 may create the temp file. If the rename happened
//! but its record commit did not, the retried final chunk finds the temp file
//! gone and the final file complete, and commits without writing.

use super::store::{RecordUpdate, UploadStore};
use super::{
    check_chunk, BusinessMeta, ChunkStream, LocalMeta, StorageBackend, StorageError,
    UploadLocks, UploadRecord,
};
use crate::metrics;
use crate::tus::metadata::UploadMetadata;
use async_trait::async_trait;
use futures::StreamExt;
use std::io::{self, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Local file storage backend
pub struct LocalBackend {
    store: Arc<dyn UploadStore>,
    locks: UploadLocks,
}

impl LocalBackend {
    pub fn new(store: Arc<dyn UploadStore>) -> Self {
        Self {
            store,
            locks: UploadLocks::new(),
        }
    }

    fn local_meta<'a>(record: &'a UploadRecord) -> Result<&'a LocalMeta, StorageError> {
        match &record.business_meta {
            BusinessMeta::Local(meta) => Ok(meta),
            _ => Err(StorageError::MetaMismatch(record.upload_id.clone())),
        }
    }
}

/// Write exactly `size` bytes of `body` into `path` starting at `offset`
async fn write_at(path: &Path, offset: u64, size: u64, mut body: ChunkStream) -> Result<(), StorageError> {
    let opened = OpenOptions::new()
        .create(offset == 0)
        .write(true)
        .truncate(false)
        .open(path)
        .await;
    let mut file = match opened {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StorageError::DataMissing(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    file.seek(SeekFrom::Start(offset)).await?;

    let mut written: u64 = 0;
    while let Some(piece) = body.next().await {
        let piece = piece?;
        if written + piece.len() as u64 > size {
            return Err(StorageError::InvalidChunk(format!(
                "body is longer than the declared {} bytes",
                size
            )));
        }
        file.write_all(&piece).await?;
        written += piece.len() as u64;
    }

    if written < size {
        return Err(StorageError::InvalidChunk(format!(
            "body ended after {} of {} bytes",
            written, size
        )));
    }

    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

/// Move a complete temp file to its final name without replacing another file
async fn finalize(tmp_path: &Path, final_path: &Path) -> Result<(), StorageError> {
    if fs::try_exists(final_path).await? {
        return Err(StorageError::DestinationExists(
            final_path.display().to_string(),
        ));
    }
    fs::rename(tmp_path, final_path).await?;
    Ok(())
}

/// Whether an earlier attempt already produced the complete final file
async fn already_finalized(meta: &LocalMeta, total_size: u64) -> Result<bool, StorageError> {
    if fs::try_exists(meta.tmp_path()).await? {
        return Ok(false);
    }
    Ok(fs::metadata(meta.final_path())
        .await
        .map(|m| m.is_file() && m.len() == total_size)
        .unwrap_or(false))
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn create(
        &self,
        upload_id: &str,
        total_size: u64,
        upload_meta: UploadMetadata,
        business_meta: BusinessMeta,
    ) -> Result<UploadRecord, StorageError> {
        let BusinessMeta::Local(meta) = &business_meta else {
            return Err(StorageError::MetaMismatch(upload_id.to_string()));
        };

        let is_dir = fs::metadata(&meta.dir_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(StorageError::DestinationMissing(
                meta.dir_path.display().to_string(),
            ));
        }

        Ok(self
            .store
            .insert(upload_id, total_size, upload_meta, business_meta)
            .await?)
    }

    async fn get(&self, upload_id: &str) -> Result<Option<UploadRecord>, StorageError> {
        Ok(self.store.get(upload_id).await?)
    }

    #[tracing::instrument(
        name = "storage.local.write_chunk",
        skip(self, body),
        fields(upload.offset = offset, upload.bytes = size),
        err
    )]
    async fn write_chunk(
        &self,
        upload_id: &str,
        offset: u64,
        size: u64,
        body: ChunkStream,
    ) -> Result<UploadRecord, StorageError> {
        let _guard = self.locks.acquire(upload_id).await;

        let record = self
            .store
            .get(upload_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(upload_id.to_string()))?;
        check_chunk(&record, offset, size)?;
        let meta = Self::local_meta(&record)?;

        let new_offset = offset + size;
        let finished = new_offset == record.total_size;

        if finished && already_finalized(meta, record.total_size).await? {
            tracing::warn!(
                upload_id = %upload_id,
                offset = offset,
                "Final file already in place, committing without writing"
            );
        } else {
            let tmp_path = meta.tmp_path();
            write_at(&tmp_path, offset, size, body).await?;
            if finished {
                finalize(&tmp_path, &meta.final_path()).await?;
            }
        }

        let updated = self
            .store
            .commit(
                upload_id,
                offset,
                RecordUpdate {
                    offset: new_offset,
                    finished,
                    business_meta: record.business_meta.clone(),
                },
            )
            .await?;

        if finished {
            self.locks.release(upload_id);
            metrics::record_upload_completed("local");
            tracing::info!(
                upload_id = %upload_id,
                path = %meta.final_path().display(),
                "Local upload finalized"
            );
        } else {
            tracing::debug!(upload_id = %upload_id, offset = new_offset, "Local chunk committed");
        }
        Ok(updated)
    }

    async fn delete(&self, upload_id: &str) -> Result<(), StorageError> {
        let _guard = self.locks.acquire(upload_id).await;

        let record = self
            .store
            .get(upload_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(upload_id.to_string()))?;
        let meta = Self::local_meta(&record)?;

        remove_if_present(&meta.tmp_path()).await?;
        if record.finished {
            remove_if_present(&meta.final_path()).await?;
        }

        self.store.remove(upload_id).await?;
        self.locks.release(upload_id);

        tracing::info!(upload_id = %upload_id, finished = record.finished, "Local upload deleted");
        Ok(())
    }
}
