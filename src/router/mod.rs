//! tus Router
//!
//! Parses incoming requests into tus operations and resolves path prefixes
//! to configured endpoints.
//!
//! | Path | Method | Operation |
//! |------|--------|-----------|
//! | `{prefix}` | OPTIONS | Options |
//! | `{prefix}` | POST | Create |
//! | `{prefix}/{id}` | OPTIONS | Options |
//! | `{prefix}/{id}` | HEAD | Head |
//! | `{prefix}/{id}` | PATCH | Patch |

use crate::config::{Config, EndpointConfig};
use thiserror::Error;

/// Router errors
#[derive(Error, Debug, PartialEq)]
pub enum RouterError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),
}

/// tus operation types
#[derive(Debug, Clone, PartialEq)]
pub enum TusOperation {
    /// OPTIONS {prefix}[/{id}]
    Options,
    /// POST {prefix}
    Create,
    /// HEAD {prefix}/{id}
    Head { upload_id: String },
    /// PATCH {prefix}/{id}
    Patch { upload_id: String },
}

/// tus Request Parser
pub struct TusRequestParser;

impl TusRequestParser {
    /// Parse a method and the path remainder after the endpoint prefix
    pub fn parse(method: &str, rest: &str) -> Result<TusOperation, RouterError> {
        if rest.is_empty() {
            return match method {
                "OPTIONS" => Ok(TusOperation::Options),
                "POST" => Ok(TusOperation::Create),
                _ => Err(RouterError::MethodNotAllowed(format!(
                    "{} not allowed on the creation URL",
                    method
                ))),
            };
        }

        let upload_id = rest
            .strip_prefix('/')
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .ok_or_else(|| RouterError::InvalidPath(rest.to_string()))?
            .to_string();

        match method {
            "OPTIONS" => Ok(TusOperation::Options),
            "HEAD" => Ok(TusOperation::Head { upload_id }),
            "PATCH" => Ok(TusOperation::Patch { upload_id }),
            _ => Err(RouterError::MethodNotAllowed(format!(
                "{} not allowed on an upload URL",
                method
            ))),
        }
    }
}

/// Endpoint Resolver
///
/// Maps incoming request paths to configured endpoints. Prefixes match on
/// segment boundaries and the longest match wins, so `/uploads2/x` never
/// resolves to `/uploads`.
pub struct EndpointResolver {
    endpoints: Vec<EndpointConfig>,
}

impl EndpointResolver {
    /// Create a new endpoint resolver from configuration
    pub fn new(config: &Config) -> Self {
        Self {
            endpoints: config.endpoints.clone(),
        }
    }

    /// Resolve a path to an endpoint and the remainder after its prefix
    pub fn resolve<'p>(&self, path: &'p str) -> Result<(&EndpointConfig, &'p str), RouterError> {
        if !path.starts_with('/') {
            return Err(RouterError::InvalidPath("Path must start with /".into()));
        }

        self.endpoints
            .iter()
            .filter_map(|endpoint| {
                let rest = path.strip_prefix(endpoint.path_prefix.as_str())?;
                (rest.is_empty() || rest.starts_with('/')).then_some((endpoint, rest))
            })
            .max_by_key(|(endpoint, _)| endpoint.path_prefix.len())
            .ok_or_else(|| RouterError::EndpointNotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        LocalStorageConfig, MetricsConfig, RecordStoreConfig, ServerConfig, StorageConfig,
    };

    fn endpoint(name: &str, prefix: &str) -> EndpointConfig {
        EndpointConfig {
            name: name.into(),
            path_prefix: prefix.into(),
            max_size: 1024,
            storage: StorageConfig::Local(LocalStorageConfig {
                dir_path: "/tmp".into(),
            }),
            records: RecordStoreConfig::Memory,
        }
    }

    fn resolver() -> EndpointResolver {
        EndpointResolver::new(&Config {
            server: ServerConfig {
                address: "127.0.0.1:0".into(),
                public_base_url: None,
            },
            endpoints: vec![
                endpoint("uploads", "/uploads"),
                endpoint("nested", "/uploads/private"),
            ],
            metrics: MetricsConfig::default(),
        })
    }

    #[test]
    fn test_parse_creation_url() {
        assert_eq!(
            TusRequestParser::parse("POST", ""),
            Ok(TusOperation::Create)
        );
        assert_eq!(
            TusRequestParser::parse("OPTIONS", ""),
            Ok(TusOperation::Options)
        );
        assert!(matches!(
            TusRequestParser::parse("PATCH", ""),
            Err(RouterError::MethodNotAllowed(_))
        ));
    }

    #[test]
    fn test_parse_upload_url() {
        assert_eq!(
            TusRequestParser::parse("PATCH", "/abc"),
            Ok(TusOperation::Patch {
                upload_id: "abc".into()
            })
        );
        assert_eq!(
            TusRequestParser::parse("HEAD", "/abc"),
            Ok(TusOperation::Head {
                upload_id: "abc".into()
            })
        );
        assert!(matches!(
            TusRequestParser::parse("GET", "/abc"),
            Err(RouterError::MethodNotAllowed(_))
        ));
        assert!(matches!(
            TusRequestParser::parse("DELETE", "/abc"),
            Err(RouterError::MethodNotAllowed(_))
        ));
    }

    #[test]
    fn test_parse_invalid_upload_path() {
        for rest in ["/", "/a/b"] {
            assert!(matches!(
                TusRequestParser::parse("HEAD", rest),
                Err(RouterError::InvalidPath(_))
            ));
        }
    }

    #[test]
    fn test_resolve_longest_prefix() {
        let resolver = resolver();

        let (found, rest) = resolver.resolve("/uploads/private/abc").unwrap();
        assert_eq!(found.name, "nested");
        assert_eq!(rest, "/abc");

        let (found, rest) = resolver.resolve("/uploads/abc").unwrap();
        assert_eq!(found.name, "uploads");
        assert_eq!(rest, "/abc");

        let (found, rest) = resolver.resolve("/uploads").unwrap();
        assert_eq!(found.name, "uploads");
        assert_eq!(rest, "");
    }

    #[test]
    fn test_resolve_prefix_boundary() {
        let resolver = resolver();
        assert!(matches!(
            resolver.resolve("/uploads2/abc"),
            Err(RouterError::EndpointNotFound(_))
        ));
        assert!(matches!(
            resolver.resolve("uploads"),
            Err(RouterError::InvalidPath(_))
        ));
    }
}
