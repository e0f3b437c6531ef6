//! Shared test fixtures
//!
//! - In-memory object store that records every call
//! - Record store whose finishing commit can be made to fail
//! - Request header builders for the protocol engine

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tus_uploadr::s3::{
    ObjectStore, S3ClientError, S3CompleteMultipartUploadResponse, S3CompletedPart,
    S3CreateMultipartUploadResponse, S3PutObjectResponse, S3UploadPartResponse,
};
use tus_uploadr::storage::{
    BusinessMeta, MemoryUploadStore, RecordUpdate, StoreError, UploadRecord, UploadStore,
};
use tus_uploadr::tus::{RequestHeaders, UploadMetadata};

/// Object store call, as observed by [`FakeObjectStore`]
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    BucketExists(String),
    PutObject { key: String, size: usize, content_type: String },
    CreateMultipart { key: String },
    UploadPart { session: String, part_number: u32, size: usize },
    Complete { session: String, parts: Vec<u32> },
    Abort { session: String },
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    objects: HashMap<String, Bytes>,
    sessions: HashMap<String, BTreeMap<u32, Bytes>>,
    next_session: u32,
    fail_parts: HashSet<u32>,
}

/// In-memory S3 stand-in
pub struct FakeObjectStore {
    buckets: HashSet<String>,
    state: Mutex<State>,
}

impl FakeObjectStore {
    pub fn with_bucket(bucket: &str) -> Self {
        Self {
            buckets: [bucket.to_string()].into_iter().collect(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn without_buckets() -> Self {
        Self {
            buckets: HashSet::new(),
            state: Mutex::new(State::default()),
        }
    }

    /// Make every upload of `part_number` fail
    pub fn fail_part(&self, part_number: u32) {
        self.state.lock().unwrap().fail_parts.insert(part_number);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn check_bucket(&self, bucket: &str) -> Result<(), S3ClientError> {
        if self.buckets.contains(bucket) {
            Ok(())
        } else {
            Err(S3ClientError::ResponseError(format!("NoSuchBucket: {}", bucket)))
        }
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, S3ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::BucketExists(bucket.to_string()));
        Ok(self.buckets.contains(bucket))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<S3PutObjectResponse, S3ClientError> {
        self.check_bucket(bucket)?;
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::PutObject {
            key: key.to_string(),
            size: body.len(),
            content_type: content_type.to_string(),
        });
        state.objects.insert(key.to_string(), body);
        Ok(S3PutObjectResponse {
            etag: "\"whole\"".into(),
        })
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        _content_type: &str,
    ) -> Result<S3CreateMultipartUploadResponse, S3ClientError> {
        self.check_bucket(bucket)?;
        let mut state = self.state.lock().unwrap();
        state.next_session += 1;
        let session = format!("session-{}", state.next_session);
        state.calls.push(Call::CreateMultipart {
            key: key.to_string(),
        });
        state.sessions.insert(session.clone(), BTreeMap::new());
        Ok(S3CreateMultipartUploadResponse { upload_id: session })
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<S3UploadPartResponse, S3ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::UploadPart {
            session: upload_id.to_string(),
            part_number,
            size: body.len(),
        });
        if state.fail_parts.contains(&part_number) {
            return Err(S3ClientError::RequestError("connection reset".into()));
        }
        let parts = state
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| S3ClientError::NoSuchUpload(upload_id.to_string()))?;
        parts.insert(part_number, body);
        Ok(S3UploadPartResponse {
            etag: format!("\"etag-{}\"", part_number),
        })
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<S3CompletedPart>,
    ) -> Result<S3CompleteMultipartUploadResponse, S3ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Complete {
            session: upload_id.to_string(),
            parts: parts.iter().map(|p| p.part_number).collect(),
        });
        let uploaded = state
            .sessions
            .remove(upload_id)
            .ok_or_else(|| S3ClientError::NoSuchUpload(upload_id.to_string()))?;

        let mut object = Vec::new();
        for part in &parts {
            let data = uploaded
                .get(&part.part_number)
                .ok_or_else(|| S3ClientError::ResponseError("InvalidPart".into()))?;
            object.extend_from_slice(data);
        }
        state.objects.insert(key.to_string(), Bytes::from(object));
        Ok(S3CompleteMultipartUploadResponse {
            etag: "\"multipart\"".into(),
        })
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), S3ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Abort {
            session: upload_id.to_string(),
        });
        state
            .sessions
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| S3ClientError::NoSuchUpload(upload_id.to_string()))
    }
}

/// [`MemoryUploadStore`] that can lose the commit marking an upload finished
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryUploadStore,
    fail_finishing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next commit that would mark an upload finished
    pub fn fail_next_finishing_commit(&self) {
        self.fail_finishing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl UploadStore for FlakyStore {
    async fn insert(
        &self,
        upload_id: &str,
        total_size: u64,
        upload_meta: UploadMetadata,
        business_meta: BusinessMeta,
    ) -> Result<UploadRecord, StoreError> {
        self.inner
            .insert(upload_id, total_size, upload_meta, business_meta)
            .await
    }

    async fn get(&self, upload_id: &str) -> Result<Option<UploadRecord>, StoreError> {
        self.inner.get(upload_id).await
    }

    async fn commit(
        &self,
        upload_id: &str,
        expected_offset: u64,
        update: RecordUpdate,
    ) -> Result<UploadRecord, StoreError> {
        if update.finished && self.fail_finishing.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".into()));
        }
        self.inner.commit(upload_id, expected_offset, update).await
    }

    async fn remove(&self, upload_id: &str) -> Result<UploadRecord, StoreError> {
        self.inner.remove(upload_id).await
    }
}

/// Build an engine header map from `(name, value)` pairs
pub fn headers(pairs: &[(&str, &str)]) -> RequestHeaders {
    pairs
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
        .collect()
}

/// Headers of a valid creation request
pub fn creation_headers(length: &str, metadata: &str) -> RequestHeaders {
    headers(&[
        ("Tus-Resumable", "1.0.0"),
        ("Content-Length", "0"),
        ("Upload-Length", length),
        ("Upload-Metadata", metadata),
    ])
}

/// Headers of a valid chunk request
pub fn patch_headers(offset: u64, length: usize) -> RequestHeaders {
    headers(&[
        ("Tus-Resumable", "1.0.0"),
        ("Content-Type", "application/offset+octet-stream"),
        ("Upload-Offset", &offset.to_string()),
        ("Content-Length", &length.to_string()),
    ])
}

/// `filename` metadata entry for `name`
pub fn filename_metadata(name: &str) -> String {
    let mut meta = tus_uploadr::tus::UploadMetadata::new();
    meta.insert("filename".into(), Some(name.into()));
    tus_uploadr::tus::metadata::encode(&meta)
}
