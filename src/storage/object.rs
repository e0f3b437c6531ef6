//! Object storage backend
//!
//! Uploads land in an S3-compatible bucket in one of two regimes, chosen by
//! the first chunk:
//!
//! - **Whole object**: the first chunk covers the full upload, so it is sent
//!   with a single PutObject and no multipart state is kept.
//! - **Multipart**: the first chunk fixes the part size. Every chunk becomes
//!   part `offset / part_size + 1`, and the completing chunk issues
//!   CompleteMultipartUpload with all recorded parts in order.
//!
//! Every successful write commits offset, finished flag and part list in one
//! compare-and-swap against the offset the write targeted.
//!
//! Before CompleteMultipartUpload the full part list is committed with a
//! `completing` marker and the offset unchanged. A retried final chunk then
//! re-issues only the completion, and a session the store no longer knows is
//! taken as already completed.

use super::store::{RecordUpdate, UploadStore};
use super::{
    check_chunk, read_chunk, BusinessMeta, ChunkStream, MultipartState, ObjectMeta,
    StorageBackend, StorageError, UploadLocks, UploadRecord, UploadedPart,
};
use crate::metrics;
use crate::s3::{ObjectStore, S3ClientError, S3CompletedPart};
use crate::tus::metadata::UploadMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Minimum part size accepted by S3 for all but the last part (5MB)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum parts allowed in one multipart upload
pub const MAX_PARTS: u64 = 10000;

/// S3-compatible object storage backend
pub struct ObjectBackend {
    client: Arc<dyn ObjectStore>,
    store: Arc<dyn UploadStore>,
    locks: UploadLocks,
}

impl ObjectBackend {
    pub fn new(client: Arc<dyn ObjectStore>, store: Arc<dyn UploadStore>) -> Self {
        Self {
            client,
            store,
            locks: UploadLocks::new(),
        }
    }

    fn object_meta(record: &UploadRecord) -> Result<&ObjectMeta, StorageError> {
        match &record.business_meta {
            BusinessMeta::Object(meta) => Ok(meta),
            _ => Err(StorageError::MetaMismatch(record.upload_id.clone())),
        }
    }

    fn content_type(record: &UploadRecord, meta: &ObjectMeta) -> String {
        let name = record.filename().unwrap_or(&meta.object_name);
        mime_guess::from_path(name)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }

    async fn commit(
        &self,
        record: &UploadRecord,
        offset: u64,
        size: u64,
        meta: ObjectMeta,
    ) -> Result<UploadRecord, StorageError> {
        let new_offset = offset + size;
        let updated = self
            .store
            .commit(
                &record.upload_id,
                offset,
                RecordUpdate {
                    offset: new_offset,
                    finished: new_offset == record.total_size,
                    business_meta: BusinessMeta::Object(meta),
                },
            )
            .await?;

        if updated.finished {
            self.locks.release(&record.upload_id);
            metrics::record_upload_completed("object");
        }
        Ok(updated)
    }

    /// Single PutObject for a first chunk that covers the whole upload
    async fn put_whole(
        &self,
        record: &UploadRecord,
        meta: &ObjectMeta,
        data: Bytes,
    ) -> Result<UploadRecord, StorageError> {
        let content_type = Self::content_type(record, meta);
        let size = data.len() as u64;

        self.client
            .put_object(&meta.bucket, &meta.object_name, data, &content_type)
            .await?;

        tracing::info!(
            upload_id = %record.upload_id,
            bucket = %meta.bucket,
            key = %meta.object_name,
            "Object uploaded in a single request"
        );

        self.commit(record, 0, size, meta.clone()).await
    }

    /// Open a multipart session sized by the first chunk
    async fn open_session(
        &self,
        record: &UploadRecord,
        meta: &ObjectMeta,
        part_size: u64,
    ) -> Result<MultipartState, StorageError> {
        let part_count = record.total_size.div_ceil(part_size);
        if part_count > MAX_PARTS {
            return Err(StorageError::InvalidChunk(format!(
                "part size {} would need {} parts (maximum {})",
                part_size, part_count, MAX_PARTS
            )));
        }
        if part_size < MIN_PART_SIZE {
            tracing::warn!(
                upload_id = %record.upload_id,
                part_size = part_size,
                "Part size below the S3 minimum (5MB); the object store may reject completion"
            );
        }

        let content_type = Self::content_type(record, meta);
        let session = self
            .client
            .create_multipart_upload(&meta.bucket, &meta.object_name, &content_type)
            .await?;

        metrics::record_multipart_event("opened");
        tracing::info!(
            upload_id = %record.upload_id,
            session = %session.upload_id,
            part_size = part_size,
            part_count = part_count,
            "Multipart session opened"
        );

        Ok(MultipartState {
            remote_session_id: session.upload_id,
            part_size,
            part_count: part_count as u32,
            parts: Vec::new(),
            completing: false,
        })
    }

    /// Reject chunks that do not line up with the recorded part size
    fn check_part_alignment(
        record: &UploadRecord,
        state: &MultipartState,
        offset: u64,
        size: u64,
    ) -> Result<(), StorageError> {
        let is_final = offset + size == record.total_size;
        let aligned = offset % state.part_size == 0
            && if is_final {
                size <= state.part_size
            } else {
                size == state.part_size
            };

        if !aligned {
            return Err(StorageError::InvalidChunk(format!(
                "chunk of {} bytes at offset {} does not match part size {}",
                size, offset, state.part_size
            )));
        }
        Ok(())
    }

    async fn abort_session(&self, meta: &ObjectMeta, state: &MultipartState) {
        match self
            .client
            .abort_multipart_upload(&meta.bucket, &meta.object_name, &state.remote_session_id)
            .await
        {
            Ok(()) => metrics::record_multipart_event("aborted"),
            Err(e) => tracing::warn!(
                session = %state.remote_session_id,
                error = %e,
                "Failed to abort multipart session"
            ),
        }
    }

    async fn write_part(
        &self,
        record: &UploadRecord,
        meta: &ObjectMeta,
        offset: u64,
        data: Bytes,
    ) -> Result<UploadRecord, StorageError> {
        let size = data.len() as u64;

        let (mut state, fresh) = match &meta.multipart {
            Some(state) => (state.clone(), false),
            None if offset == 0 => (self.open_session(record, meta, size).await?, true),
            None => {
                return Err(StorageError::InvalidChunk(format!(
                    "no multipart session open for chunk at offset {}",
                    offset
                )))
            }
        };

        let part_number = (offset / state.part_size + 1) as u32;
        if !state.completing {
            let part = match self
                .client
                .upload_part(
                    &meta.bucket,
                    &meta.object_name,
                    &state.remote_session_id,
                    part_number,
                    data,
                )
                .await
            {
                Ok(part) => part,
                Err(e) => {
                    if fresh {
                        self.abort_session(meta, &state).await;
                    }
                    return Err(e.into());
                }
            };

            state.parts.push(UploadedPart {
                part_number,
                etag: part.etag,
            });
        }

        let mut updated_meta = meta.clone();
        if offset + size == record.total_size {
            self.complete_session(record, &mut updated_meta, state, offset)
                .await?;
        } else {
            updated_meta.multipart = Some(state);
        }
        self.commit(record, offset, size, updated_meta).await
    }

    /// Record the completing marker, then complete the session
    async fn complete_session(
        &self,
        record: &UploadRecord,
        meta: &mut ObjectMeta,
        mut state: MultipartState,
        offset: u64,
    ) -> Result<(), StorageError> {
        let resumed = state.completing;
        if !resumed {
            state.completing = true;
            meta.multipart = Some(state.clone());
            self.store
                .commit(
                    &record.upload_id,
                    offset,
                    RecordUpdate {
                        offset,
                        finished: false,
                        business_meta: BusinessMeta::Object(meta.clone()),
                    },
                )
                .await?;
        }

        let parts = state
            .parts
            .iter()
            .map(|p| S3CompletedPart {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect();
        match self
            .client
            .complete_multipart_upload(
                &meta.bucket,
                &meta.object_name,
                &state.remote_session_id,
                parts,
            )
            .await
        {
            Ok(_) => {
                metrics::record_multipart_event("completed");
                tracing::info!(
                    upload_id = %record.upload_id,
                    session = %state.remote_session_id,
                    parts = state.parts.len(),
                    "Multipart upload completed"
                );
            }
            Err(S3ClientError::NoSuchUpload(_)) if resumed => {
                tracing::warn!(
                    upload_id = %record.upload_id,
                    session = %state.remote_session_id,
                    "Session already completed by an earlier attempt"
                );
            }
            Err(e) => return Err(e.into()),
        }

        meta.multipart = Some(state);
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for ObjectBackend {
    async fn create(
        &self,
        upload_id: &str,
        total_size: u64,
        upload_meta: UploadMetadata,
        business_meta: BusinessMeta,
    ) -> Result<UploadRecord, StorageError> {
        let BusinessMeta::Object(meta) = &business_meta else {
            return Err(StorageError::MetaMismatch(upload_id.to_string()));
        };

        if !self.client.bucket_exists(&meta.bucket).await? {
            return Err(StorageError::DestinationMissing(format!(
                "bucket {}",
                meta.bucket
            )));
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
        name = "storage.object.write_chunk",
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
        let meta = Self::object_meta(&record)?;
        if let Some(state) = &meta.multipart {
            Self::check_part_alignment(&record, state, offset, size)?;
        }

        let data = read_chunk(body, size).await?;

        if offset == 0 && size == record.total_size && meta.multipart.is_none() {
            self.put_whole(&record, meta, data).await
        } else {
            self.write_part(&record, meta, offset, data).await
        }
    }

    async fn delete(&self, upload_id: &str) -> Result<(), StorageError> {
        let _guard = self.locks.acquire(upload_id).await;

        let record = self
            .store
            .get(upload_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(upload_id.to_string()))?;
        let meta = Self::object_meta(&record)?;

        if let (Some(state), false) = (&meta.multipart, record.finished) {
            match self
                .client
                .abort_multipart_upload(&meta.bucket, &meta.object_name, &state.remote_session_id)
                .await
            {
                Ok(()) => {
                    metrics::record_multipart_event("aborted");
                    tracing::info!(
                        upload_id = %upload_id,
                        session = %state.remote_session_id,
                        "Multipart session aborted"
                    );
                }
                Err(S3ClientError::NoSuchUpload(_)) => tracing::info!(
                    upload_id = %upload_id,
                    session = %state.remote_session_id,
                    "Multipart session already gone"
                ),
                Err(e) => return Err(e.into()),
            }
        }

        self.store.remove(upload_id).await?;
        self.locks.release(upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(total_size: u64, offset: u64) -> UploadRecord {
        UploadRecord {
            record_id: 1,
            upload_id: "u1".into(),
            total_size,
            offset,
            upload_meta: UploadMetadata::new(),
            business_meta: BusinessMeta::Object(ObjectMeta {
                bucket: "b".into(),
                object_name: "o.bin".into(),
                multipart: None,
            }),
            finished: false,
            create_time: Utc::now(),
            update_time: Utc::now(),
        }
    }

    fn state(part_size: u64) -> MultipartState {
        MultipartState {
            remote_session_id: "s".into(),
            part_size,
            part_count: 3,
            parts: vec![],
            completing: false,
        }
    }

    #[test]
    fn test_part_alignment() {
        let r = record(25, 10);
        let s = state(10);

        assert!(ObjectBackend::check_part_alignment(&r, &s, 10, 10).is_ok());
        // Shorter final part
        assert!(ObjectBackend::check_part_alignment(&r, &s, 20, 5).is_ok());
        // Non-final chunk of the wrong size
        assert!(ObjectBackend::check_part_alignment(&r, &s, 10, 7).is_err());
        // Final chunk larger than a part
        assert!(ObjectBackend::check_part_alignment(&r, &s, 10, 15).is_err());
    }

    #[test]
    fn test_content_type_from_filename() {
        let mut r = record(10, 0);
        r.upload_meta
            .insert("filename".into(), Some("report.pdf".into()));
        let meta = ObjectBackend::object_meta(&r).unwrap();

        assert_eq!(ObjectBackend::content_type(&r, meta), "application/pdf");
    }

    #[test]
    fn test_content_type_defaults_to_octet_stream() {
        let r = record(10, 0);
        let mut meta = ObjectBackend::object_meta(&r).unwrap().clone();
        meta.object_name = "blob".into();

        assert_eq!(
            ObjectBackend::content_type(&r, &meta),
            "application/octet-stream"
        );
    }
}
