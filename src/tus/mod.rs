//! tus 1.0.0 protocol engine
//!
//! Each handler is a short-circuiting chain of header checks followed by at
//! most one storage backend call. Checks have no side effects, so a rejected
//! request never changes an upload.
//!
//! | Handler | Method | Success |
//! |---------|--------|---------|
//! | [`handle_options`] | OPTIONS | 204 + capabilities |
//! | [`handle_head`] | HEAD | 204 + `Upload-Offset` / `Upload-Length` |
//! | [`handle_creation`] | POST | 201 + `Location` |
//! | [`handle_patch`] | PATCH | 204 + new `Upload-Offset` |

use crate::metrics;
use crate::storage::{BusinessMeta, ChunkStream, StorageBackend};
use std::collections::HashMap;
use std::time::Instant;

pub mod error;
pub mod metadata;

pub use error::TusError;
pub use metadata::UploadMetadata;

/// Protocol header names and fixed values
pub mod header {
    pub const TUS_RESUMABLE: &str = "Tus-Resumable";
    pub const TUS_RESUMABLE_VALUE: &str = "1.0.0";

    pub const TUS_VERSION: &str = "Tus-Version";
    pub const TUS_VERSION_VALUE: &str = "1.0.0";

    pub const TUS_MAX_SIZE: &str = "Tus-Max-Size";

    pub const TUS_EXTENSION: &str = "Tus-Extension";
    pub const TUS_EXTENSION_VALUE: &str = "creation,expiration";

    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const UPLOAD_LENGTH: &str = "Upload-Length";
    pub const UPLOAD_METADATA: &str = "Upload-Metadata";
    pub const UPLOAD_OFFSET: &str = "Upload-Offset";
    pub const LOCATION: &str = "Location";
    pub const CACHE_CONTROL: &str = "Cache-Control";

    /// Media type required on chunk requests
    pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";
}

/// Request headers keyed by lowercase name
pub type RequestHeaders = HashMap<String, String>;

/// Normalized protocol response
#[derive(Debug, Clone, PartialEq)]
pub struct TusResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<String>,
}

impl TusResponse {
    fn new(status: u16) -> Self {
        Self {
            status,
            headers: vec![(header::TUS_RESUMABLE, header::TUS_RESUMABLE_VALUE.into())],
            body: None,
        }
    }

    fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Value of a response header, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Fold a handler result into the response sent to the client
pub fn respond(result: Result<TusResponse, TusError>) -> TusResponse {
    result.unwrap_or_else(|err| {
        metrics::record_protocol_error(err.kind());
        err.into_response()
    })
}

fn require<'a>(headers: &'a RequestHeaders, name: &str) -> Result<&'a str, TusError> {
    headers
        .get(&name.to_ascii_lowercase())
        .map(String::as_str)
        .ok_or_else(|| TusError::MissingHeader(name.to_string()))
}

fn require_number(headers: &RequestHeaders, name: &str) -> Result<i64, TusError> {
    let value = require(headers, name)?;
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| TusError::InvalidHeader(name.to_string(), value.to_string()))
}

fn check_resumable(headers: &RequestHeaders) -> Result<(), TusError> {
    let version = require(headers, header::TUS_RESUMABLE)?;
    if version != header::TUS_RESUMABLE_VALUE {
        return Err(TusError::InvalidHeader(
            header::TUS_RESUMABLE.to_string(),
            version.to_string(),
        ));
    }
    Ok(())
}

/// Discover: advertise protocol version, extensions and max size
#[tracing::instrument(name = "tus.options")]
pub fn handle_options(max_size: u64) -> TusResponse {
    TusResponse::new(204)
        .with_header(header::TUS_VERSION, header::TUS_VERSION_VALUE)
        .with_header(header::TUS_MAX_SIZE, max_size.to_string())
        .with_header(header::TUS_EXTENSION, header::TUS_EXTENSION_VALUE)
}

/// Status: report the committed offset of an upload
#[tracing::instrument(name = "tus.head", skip(headers, backend), err)]
pub async fn handle_head(
    upload_id: &str,
    headers: &RequestHeaders,
    backend: &dyn StorageBackend,
) -> Result<TusResponse, TusError> {
    check_resumable(headers)?;

    let record = backend
        .get(upload_id)
        .await?
        .ok_or_else(|| TusError::UploadNotFound(upload_id.to_string()))?;

    Ok(TusResponse::new(204)
        .with_header(header::TUS_VERSION, header::TUS_VERSION_VALUE)
        .with_header(header::UPLOAD_OFFSET, record.offset.to_string())
        .with_header(header::UPLOAD_LENGTH, record.total_size.to_string())
        .with_header(header::CACHE_CONTROL, "no-store"))
}

/// Creation: validate the declared upload and persist a new record
///
/// `location` turns the new upload id into the `Location` header value.
/// `business_meta` decides where the upload will be stored; its failure
/// aborts creation before anything is persisted.
#[tracing::instrument(
    name = "tus.create",
    skip(headers, backend, location, business_meta),
    fields(upload_id = tracing::field::Empty, upload.length = tracing::field::Empty),
    err
)]
pub async fn handle_creation<L, B>(
    headers: &RequestHeaders,
    max_size: u64,
    backend: &dyn StorageBackend,
    location: L,
    business_meta: B,
) -> Result<TusResponse, TusError>
where
    L: FnOnce(&str) -> String,
    B: FnOnce(&str, &UploadMetadata) -> Result<BusinessMeta, TusError>,
{
    check_resumable(headers)?;

    let content_length = require_number(headers, header::CONTENT_LENGTH)?;
    if content_length != 0 {
        return Err(TusError::InvalidHeader(
            header::CONTENT_LENGTH.to_string(),
            content_length.to_string(),
        ));
    }

    let upload_length = require_number(headers, header::UPLOAD_LENGTH)?;
    if upload_length <= 0 {
        return Err(TusError::InvalidHeader(
            header::UPLOAD_LENGTH.to_string(),
            upload_length.to_string(),
        ));
    }
    let upload_length = upload_length as u64;
    if upload_length > max_size {
        return Err(TusError::FileSizeExceeded {
            max: max_size,
            actual: upload_length,
        });
    }

    let raw_metadata = require(headers, header::UPLOAD_METADATA)?;
    if raw_metadata.trim().is_empty() {
        return Err(TusError::InvalidHeader(
            header::UPLOAD_METADATA.to_string(),
            raw_metadata.to_string(),
        ));
    }
    let upload_meta =
        metadata::decode(raw_metadata).map_err(|e| TusError::Business(e.to_string()))?;
    if !matches!(upload_meta.get("filename"), Some(Some(_))) {
        return Err(TusError::MissingUploadMetadataField("filename".into()));
    }

    let upload_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::Span::current();
    span.record("upload_id", upload_id.as_str());
    span.record("upload.length", upload_length);

    let business_meta = business_meta(&upload_id, &upload_meta)?;
    backend
        .create(&upload_id, upload_length, upload_meta, business_meta)
        .await?;

    metrics::record_upload_created(upload_length);
    tracing::info!(upload_id = %upload_id, length = upload_length, "Upload created");

    Ok(TusResponse::new(201).with_header(header::LOCATION, location(&upload_id)))
}

/// Chunk application: append bytes at the current offset
#[tracing::instrument(
    name = "tus.patch",
    skip(headers, backend, body),
    fields(upload.offset = tracing::field::Empty, upload.bytes = tracing::field::Empty),
    err
)]
pub async fn handle_patch(
    upload_id: &str,
    headers: &RequestHeaders,
    backend: &dyn StorageBackend,
    body: ChunkStream,
) -> Result<TusResponse, TusError> {
    check_resumable(headers)?;

    let record = backend
        .get(upload_id)
        .await?
        .ok_or_else(|| TusError::UploadNotFound(upload_id.to_string()))?;

    let content_type = require(headers, header::CONTENT_TYPE)?;
    if content_type != header::OFFSET_OCTET_STREAM {
        return Err(TusError::InvalidHeader(
            header::CONTENT_TYPE.to_string(),
            content_type.to_string(),
        ));
    }

    let raw_offset = require(headers, header::UPLOAD_OFFSET)?;
    let offset = raw_offset
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|o| *o == record.offset)
        .ok_or_else(|| {
            TusError::InvalidHeader(header::UPLOAD_OFFSET.to_string(), raw_offset.to_string())
        })?;

    let content_length = require_number(headers, header::CONTENT_LENGTH)?;
    if content_length <= 0 || content_length as u64 > record.remaining() {
        return Err(TusError::InvalidHeader(
            header::CONTENT_LENGTH.to_string(),
            content_length.to_string(),
        ));
    }
    let size = content_length as u64;

    let span = tracing::Span::current();
    span.record("upload.offset", offset);
    span.record("upload.bytes", size);

    let start = Instant::now();
    let updated = match backend.write_chunk(upload_id, offset, size, body).await {
        Ok(updated) => updated,
        Err(err) => {
            metrics::record_chunk_failure();
            return Err(err.into());
        }
    };
    metrics::record_chunk_success(size, start.elapsed().as_secs_f64());

    if updated.finished {
        tracing::info!(upload_id = %upload_id, total = updated.total_size, "Upload finished");
    }

    Ok(TusResponse::new(204).with_header(header::UPLOAD_OFFSET, updated.offset.to_string()))
}
