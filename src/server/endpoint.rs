//! Endpoint wiring
//!
//! Binds one configured path prefix to its storage backend and decides where
//! each new upload will be stored.

use crate::config::{EndpointConfig, RecordStoreConfig, StorageConfig};
use crate::s3::{S3Client, S3ClientConfig};
use crate::server::ServerError;
use crate::storage::{
    BusinessMeta, FileUploadStore, LocalBackend, LocalMeta, MemoryUploadStore, ObjectBackend,
    ObjectMeta, StorageBackend, UploadStore,
};
use crate::tus::{TusError, UploadMetadata};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Where new uploads of an endpoint are placed
#[derive(Debug, Clone)]
enum Placement {
    Local { dir_path: PathBuf },
    Object { bucket: String, key_prefix: Option<String> },
}

/// A configured endpoint with its running backend
pub struct Endpoint {
    pub config: EndpointConfig,
    backend: Arc<dyn StorageBackend>,
    placement: Placement,
}

impl Endpoint {
    /// Build the backend described by the endpoint configuration
    ///
    /// Local directories are created if missing.
    pub async fn build(config: &EndpointConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn UploadStore> = match &config.records {
            RecordStoreConfig::Memory => Arc::new(MemoryUploadStore::new()),
            RecordStoreConfig::File(file) => Arc::new(
                FileUploadStore::open(&file.dir_path)
                    .await
                    .map_err(|e| ServerError::EndpointError(format!("{}: {}", config.name, e)))?,
            ),
        };

        let backend: Arc<dyn StorageBackend> = match &config.storage {
            StorageConfig::Local(local) => {
                tokio::fs::create_dir_all(&local.dir_path)
                    .await
                    .map_err(|e| {
                        ServerError::EndpointError(format!(
                            "{}: cannot create {}: {}",
                            config.name,
                            local.dir_path.display(),
                            e
                        ))
                    })?;
                Arc::new(LocalBackend::new(store))
            }
            StorageConfig::S3(s3) => {
                let client = S3Client::new(S3ClientConfig {
                    region: s3.region.clone(),
                    endpoint: s3.endpoint.clone(),
                    access_key: s3.access_key.clone(),
                    secret_key: s3.secret_key.clone(),
                })
                .await
                .map_err(|e| ServerError::EndpointError(format!("{}: {}", config.name, e)))?;
                info!(
                    endpoint = %config.name,
                    bucket = %s3.bucket,
                    region = %client.region(),
                    "S3 client ready"
                );
                Arc::new(ObjectBackend::new(Arc::new(client), store))
            }
        };

        info!(
            endpoint = %config.name,
            prefix = %config.path_prefix,
            max_size = config.max_size,
            "Endpoint ready"
        );
        Ok(Self::with_backend(config.clone(), backend))
    }

    /// Pair a configuration with an already constructed backend
    pub fn with_backend(config: EndpointConfig, backend: Arc<dyn StorageBackend>) -> Self {
        let placement = match &config.storage {
            StorageConfig::Local(local) => Placement::Local {
                dir_path: local.dir_path.clone(),
            },
            StorageConfig::S3(s3) => Placement::Object {
                bucket: s3.bucket.clone(),
                key_prefix: s3
                    .key_prefix
                    .as_deref()
                    .map(|p| p.trim_matches('/'))
                    .filter(|p| !p.is_empty())
                    .map(str::to_string),
            },
        };

        Self {
            config,
            backend,
            placement,
        }
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// `Location` of an upload created through this endpoint
    pub fn location(&self, public_base_url: &str, upload_id: &str) -> String {
        format!(
            "{}{}/{}",
            public_base_url.trim_end_matches('/'),
            self.config.path_prefix,
            upload_id
        )
    }

    /// Storage placement for a new upload
    pub fn business_meta(
        &self,
        upload_id: &str,
        meta: &UploadMetadata,
    ) -> Result<BusinessMeta, TusError> {
        let filename = meta
            .get("filename")
            .and_then(|v| v.as_deref())
            .ok_or_else(|| TusError::MissingUploadMetadataField("filename".into()))?;
        let name = stored_name(filename, upload_id);

        Ok(match &self.placement {
            Placement::Local { dir_path } => BusinessMeta::Local(LocalMeta {
                dir_path: dir_path.clone(),
                write_file_name: name,
                tmp_name: format!("{}.tmp", upload_id),
            }),
            Placement::Object { bucket, key_prefix } => BusinessMeta::Object(ObjectMeta {
                bucket: bucket.clone(),
                object_name: match key_prefix {
                    Some(prefix) => format!("{}/{}", prefix, name),
                    None => name,
                },
                multipart: None,
            }),
        })
    }
}

/// `{stem}_{id8}.{ext}` from the client filename
///
/// Only the last path component of the filename is used. A name without a
/// usable stem falls back to `upload`.
pub fn stored_name(filename: &str, upload_id: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let short_id: String = upload_id.chars().take(8).collect();

    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (base, None),
    };
    let stem = match stem {
        "" | "." | ".." => "upload",
        stem => stem,
    };

    match ext {
        Some(ext) => format!("{}_{}.{}", stem, short_id, ext),
        None => format!("{}_{}", stem, short_id),
    }
}
