//! Protocol errors and their HTTP rendering

use super::TusResponse;
use crate::storage::StorageError;
use thiserror::Error;

/// Protocol errors
///
/// Every variant renders to a client response; none of them is fatal to the
/// server.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TusError {
    #[error("Missing request header: {0}")]
    MissingHeader(String),

    #[error("Invalid request header: {0}={1}")]
    InvalidHeader(String, String),

    #[error("File size exceeded: max={max}, file={actual}")]
    FileSizeExceeded { max: u64, actual: u64 },

    #[error("Missing upload metadata: {0}")]
    MissingUploadMetadataField(String),

    #[error("Upload not found: {0}")]
    UploadNotFound(String),

    #[error("{0}")]
    Business(String),
}

impl TusError {
    pub fn status(&self) -> u16 {
        match self {
            TusError::FileSizeExceeded { .. } => 413,
            TusError::UploadNotFound(_) => 404,
            _ => 400,
        }
    }

    /// Short label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            TusError::MissingHeader(_) => "missing_header",
            TusError::InvalidHeader(..) => "invalid_header",
            TusError::FileSizeExceeded { .. } => "file_size_exceeded",
            TusError::MissingUploadMetadataField(_) => "missing_upload_metadata",
            TusError::UploadNotFound(_) => "upload_not_found",
            TusError::Business(_) => "business",
        }
    }

    pub fn into_response(self) -> TusResponse {
        let mut response = TusResponse::new(self.status());
        response.body = Some(self.to_string());
        response
    }
}

impl From<StorageError> for TusError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(upload_id) => TusError::UploadNotFound(upload_id),
            other => TusError::Business(other.to_string()),
        }
    }
}
