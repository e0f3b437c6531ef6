//! S3 Client module
//!
//! Object store operations used by the object storage backend, behind the
//! [`ObjectStore`] trait so the backend can be exercised without a live
//! S3-compatible service.
//!
//! # Tracing
//!
//! | Operation | Span Name | Attributes |
//! |-----------|-----------|------------|
//! | HeadBucket | `s3.head_bucket` | bucket, exists |
//! | PutObject | `s3.put_object` | bucket, key, bytes, etag |
//! | CreateMultipartUpload | `s3.create_multipart_upload` | bucket, key, upload_id |
//! | UploadPart | `s3.upload_part` | bucket, upload_id, part_number, bytes, etag |
//! | CompleteMultipartUpload | `s3.complete_multipart_upload` | bucket, upload_id, parts_count, etag |
//! | AbortMultipartUpload | `s3.abort_multipart_upload` | bucket, upload_id |

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use thiserror::Error;

/// S3 client errors
#[derive(Error, Debug)]
pub enum S3ClientError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Request error: {0}")]
    RequestError(String),

    #[error("Response error: {0}")]
    ResponseError(String),

    /// The multipart session is unknown to the store (completed or aborted)
    #[error("No such upload: {0}")]
    NoSuchUpload(String),
}

/// S3 Client configuration
#[derive(Debug, Clone)]
pub struct S3ClientConfig {
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// S3 PutObject response
#[derive(Debug, Clone)]
pub struct S3PutObjectResponse {
    pub etag: String,
}

/// S3 CreateMultipartUpload response
#[derive(Debug, Clone)]
pub struct S3CreateMultipartUploadResponse {
    pub upload_id: String,
}

/// S3 UploadPart response
#[derive(Debug, Clone)]
pub struct S3UploadPartResponse {
    pub etag: String,
}

/// S3 CompleteMultipartUpload response
#[derive(Debug, Clone)]
pub struct S3CompleteMultipartUploadResponse {
    pub etag: String,
}

/// S3 completed part
#[derive(Debug, Clone, PartialEq)]
pub struct S3CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Object store operations needed by resumable uploads
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, S3ClientError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<S3PutObjectResponse, S3ClientError>;

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> Result<S3CreateMultipartUploadResponse, S3ClientError>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<S3UploadPartResponse, S3ClientError>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<S3CompletedPart>,
    ) -> Result<S3CompleteMultipartUploadResponse, S3ClientError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), S3ClientError>;
}

/// S3 Client backed by the AWS SDK
pub struct S3Client {
    inner: aws_sdk_s3::Client,
    region: String,
}

impl S3Client {
    /// Create a new S3 client
    ///
    /// Static credentials from the configuration take precedence; otherwise
    /// the AWS default provider chain (environment, profile, instance role)
    /// is used. Path-style addressing is forced so that MinIO and other
    /// S3-compatible endpoints work without DNS bucket routing.
    pub async fn new(config: S3ClientConfig) -> Result<Self, S3ClientError> {
        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials = aws_credential_types::Credentials::new(
                    access_key.clone(),
                    secret_key.clone(),
                    None,
                    None,
                    "tus-uploadr-static",
                );
                aws_sdk_s3::config::Builder::new()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
            }
            (None, None) => {
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
            _ => {
                return Err(S3ClientError::ConfigError(
                    "access_key and secret_key must be set together".into(),
                ))
            }
        };

        builder = builder
            .region(Region::new(config.region.clone()))
            .force_path_style(true);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self {
            inner: aws_sdk_s3::Client::from_conf(builder.build()),
            region: config.region,
        })
    }

    /// Get the region
    pub fn region(&self) -> &str {
        &self.region
    }
}

fn request_error<E>(err: E) -> S3ClientError
where
    E: std::error::Error,
{
    S3ClientError::RequestError(DisplayErrorContext(err).to_string())
}

/// Like [`request_error`], but keeps `NoSuchUpload` distinguishable
fn session_error<E, R>(err: SdkError<E, R>) -> S3ClientError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let no_such_upload = err
        .as_service_error()
        .and_then(|e| e.code())
        .is_some_and(|code| code == "NoSuchUpload");
    if no_such_upload {
        return S3ClientError::NoSuchUpload(DisplayErrorContext(err).to_string());
    }
    request_error(err)
}

#[async_trait]
impl ObjectStore for S3Client {
    #[tracing::instrument(
        name = "s3.head_bucket",
        skip(self),
        fields(s3.bucket = %bucket, s3.exists = tracing::field::Empty),
        err
    )]
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, S3ClientError> {
        let exists = match self.inner.head_bucket().bucket(bucket).send().await {
            Ok(_) => true,
            Err(err) => {
                let not_found = err.as_service_error().is_some_and(|e| e.is_not_found())
                    || err
                        .raw_response()
                        .is_some_and(|r| r.status().as_u16() == 404);
                if !not_found {
                    return Err(request_error(err));
                }
                false
            }
        };

        tracing::Span::current().record("s3.exists", exists);
        Ok(exists)
    }

    #[tracing::instrument(
        name = "s3.put_object",
        skip(self, body),
        fields(
            s3.bucket = %bucket,
            s3.key = %key,
            upload.bytes = body.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<S3PutObjectResponse, S3ClientError> {
        let output = self
            .inner
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_length(body.len() as i64)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(request_error)?;

        let etag = output.e_tag().unwrap_or_default().to_string();
        tracing::Span::current().record("s3.etag", etag.as_str());

        Ok(S3PutObjectResponse { etag })
    }

    #[tracing::instrument(
        name = "s3.create_multipart_upload",
        skip(self),
        fields(
            s3.bucket = %bucket,
            s3.key = %key,
            s3.upload_id = tracing::field::Empty
        ),
        err
    )]
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> Result<S3CreateMultipartUploadResponse, S3ClientError> {
        let output = self
            .inner
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(request_error)?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| {
                S3ClientError::ResponseError("CreateMultipartUpload returned no UploadId".into())
            })?
            .to_string();
        tracing::Span::current().record("s3.upload_id", upload_id.as_str());

        Ok(S3CreateMultipartUploadResponse { upload_id })
    }

    #[tracing::instrument(
        name = "s3.upload_part",
        skip(self, body),
        fields(
            s3.bucket = %bucket,
            s3.upload_id = %upload_id,
            s3.part_number = part_number,
            upload.bytes = body.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<S3UploadPartResponse, S3ClientError> {
        let output = self
            .inner
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .content_length(body.len() as i64)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(session_error)?;

        let etag = output
            .e_tag()
            .ok_or_else(|| S3ClientError::ResponseError("UploadPart returned no ETag".into()))?
            .to_string();
        tracing::Span::current().record("s3.etag", etag.as_str());

        Ok(S3UploadPartResponse { etag })
    }

    #[tracing::instrument(
        name = "s3.complete_multipart_upload",
        skip(self, parts),
        fields(
            s3.bucket = %bucket,
            s3.upload_id = %upload_id,
            parts_count = parts.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<S3CompletedPart>,
    ) -> Result<S3CompleteMultipartUploadResponse, S3ClientError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(p.part_number as i32)
                            .e_tag(p.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        let output = self
            .inner
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(session_error)?;

        let etag = output.e_tag().unwrap_or_default().to_string();
        tracing::Span::current().record("s3.etag", etag.as_str());

        Ok(S3CompleteMultipartUploadResponse { etag })
    }

    #[tracing::instrument(
        name = "s3.abort_multipart_upload",
        skip(self),
        fields(s3.bucket = %bucket, s3.upload_id = %upload_id),
        err
    )]
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), S3ClientError> {
        self.inner
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(session_error)?;

        Ok(())
    }
}
