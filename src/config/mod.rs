//! Configuration module for tus-uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.
//!
//! ```yaml
//! server:
//!   address: "0.0.0.0:8080"
//!   public_base_url: "https://files.example.com"
//! endpoints:
//!   - name: local
//!     path_prefix: /tus/local/upload
//!     max_size: 104857600
//!     storage:
//!       type: local
//!       dir_path: ./data/uploads
//!   - name: minio
//!     path_prefix: /tus/minio/upload
//!     max_size: 209715200
//!     storage:
//!       type: s3
//!       bucket: uploads
//!       region: us-east-1
//!       endpoint: http://localhost:9000
//!       access_key: ${MINIO_ACCESS_KEY}
//!       secret_key: ${MINIO_SECRET_KEY:-minioadmin}
//!     records:
//!       type: file
//!       dir_path: ./data/records/minio
//! metrics:
//!   enabled: true
//!   port: 9090
//! ```

use lazy_static::lazy_static;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

lazy_static! {
    static ref ENV_VAR: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("env var pattern");
}

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
pub(crate) fn expand_env_vars(s: &str) -> String {
    ENV_VAR
        .replace_all(s, |cap: &regex_lite::Captures<'_>| {
            match (std::env::var(&cap[1]), cap.get(2)) {
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.as_str().to_string(),
                (Err(_), None) => cap[0].to_string(),
            }
        })
        .into_owned()
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(invalid("At least one endpoint must be configured"));
        }

        if let Some(url) = &self.server.public_base_url {
            if !is_valid_http_url(url) {
                return Err(invalid(format!(
                    "Invalid public_base_url '{}': must start with http:// or https://",
                    url
                )));
            }
        }

        let mut names = HashSet::new();
        let mut prefixes = HashSet::new();
        for endpoint in &self.endpoints {
            if !names.insert(endpoint.name.as_str()) {
                return Err(invalid(format!(
                    "Duplicate endpoint name '{}'",
                    endpoint.name
                )));
            }
            if !prefixes.insert(endpoint.path_prefix.as_str()) {
                return Err(invalid(format!(
                    "Duplicate path_prefix '{}'",
                    endpoint.path_prefix
                )));
            }
            endpoint.validate()?;
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    /// Prepended to `Location` headers; empty means relative locations
    #[serde(default)]
    pub public_base_url: Option<String>,
}

/// One tus endpoint: a path prefix bound to a storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub path_prefix: String,
    /// Largest accepted `Upload-Length` in bytes
    pub max_size: u64,
    pub storage: StorageConfig,
    /// Where upload records are kept; in memory unless configured
    #[serde(default)]
    pub records: RecordStoreConfig,
}

impl EndpointConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.path_prefix.starts_with('/') || self.path_prefix.len() < 2 {
            return Err(invalid(format!(
                "Endpoint '{}' path_prefix must start with '/' and not be the root",
                self.name
            )));
        }
        if self.path_prefix.ends_with('/') {
            return Err(invalid(format!(
                "Endpoint '{}' path_prefix must not end with '/'",
                self.name
            )));
        }
        if self.max_size == 0 {
            return Err(invalid(format!(
                "Endpoint '{}' max_size must be greater than 0",
                self.name
            )));
        }

        match &self.storage {
            StorageConfig::Local(local) => {
                if local.dir_path.as_os_str().is_empty() {
                    return Err(invalid(format!(
                        "Endpoint '{}' has empty dir_path",
                        self.name
                    )));
                }
            }
            StorageConfig::S3(s3) => {
                if s3.bucket.trim().is_empty() || s3.region.trim().is_empty() {
                    return Err(invalid(format!(
                        "Endpoint '{}' requires bucket and region",
                        self.name
                    )));
                }
                if s3.access_key.is_some() != s3.secret_key.is_some() {
                    return Err(invalid(format!(
                        "Endpoint '{}' must set access_key and secret_key together",
                        self.name
                    )));
                }
                if let Some(endpoint) = &s3.endpoint {
                    if !is_valid_http_url(endpoint) {
                        return Err(invalid(format!(
                            "Endpoint '{}' has invalid S3 endpoint '{}'",
                            self.name, endpoint
                        )));
                    }
                }
            }
        }

        if let RecordStoreConfig::File(file) = &self.records {
            if file.dir_path.as_os_str().is_empty() {
                return Err(invalid(format!(
                    "Endpoint '{}' has empty records dir_path",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// Upload record store selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RecordStoreConfig {
    /// Records are lost on restart
    #[default]
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "file")]
    File(FileRecordStoreConfig),
}

/// One JSON file per upload under `dir_path`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecordStoreConfig {
    pub dir_path: PathBuf,
}

/// Storage backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    #[serde(rename = "local")]
    Local(LocalStorageConfig),
    #[serde(rename = "s3")]
    S3(S3StorageConfig),
}

/// Local directory storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    pub dir_path: PathBuf,
}

/// S3 backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StorageConfig {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Object keys are placed under this prefix
    #[serde(default)]
    pub key_prefix: Option<String>,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}
