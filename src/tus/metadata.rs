//! `Upload-Metadata` codec
//!
//! The header carries comma-separated entries. Each entry is either a bare
//! key (a flag, decoded to `None`) or a key and a base64-encoded UTF-8 value
//! separated by a single space:
//!
//! ```text
//! filename d29ybGRfZG9taW5hdGlvbl9wbGFuLnBkZg==,is_confidential
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use thiserror::Error;

/// Decoded upload metadata: key to optional plain-text value
pub type UploadMetadata = HashMap<String, Option<String>>;

/// Metadata decoding errors
#[derive(Error, Debug, PartialEq)]
pub enum MetadataError {
    #[error("Invalid base64 value for metadata key '{key}'")]
    InvalidBase64 { key: String },

    #[error("Metadata value for key '{key}' is not valid UTF-8")]
    InvalidUtf8 { key: String },
}

/// Decode a raw `Upload-Metadata` header value.
///
/// Blank input decodes to an empty map. A later duplicate key replaces an
/// earlier one.
pub fn decode(raw: &str) -> Result<UploadMetadata, MetadataError> {
    let mut metadata = UploadMetadata::new();

    if raw.trim().is_empty() {
        return Ok(metadata);
    }

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once(' ') {
            Some((key, encoded)) => {
                let bytes = STANDARD
                    .decode(encoded)
                    .map_err(|_| MetadataError::InvalidBase64 { key: key.into() })?;
                let value = String::from_utf8(bytes)
                    .map_err(|_| MetadataError::InvalidUtf8 { key: key.into() })?;
                metadata.insert(key.to_string(), Some(value));
            }
            None => {
                metadata.insert(entry.to_string(), None);
            }
        }
    }

    Ok(metadata)
}

/// Encode metadata back into header form, entries sorted by key
pub fn encode(metadata: &UploadMetadata) -> String {
    let mut keys: Vec<&String> = metadata.keys().collect();
    keys.sort();

    keys.into_iter()
        .map(|key| match &metadata[key] {
            Some(value) => format!("{} {}", key, STANDARD.encode(value)),
            None => key.clone(),
        })
        .collect::<Vec<_>>()
        .join(",")
}
