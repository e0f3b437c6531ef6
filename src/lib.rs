//! tus Uploadr Library
//!
//! Resumable upload server implementing the tus 1.0.0 protocol core with the
//! creation extension, storing uploads on local disk or in S3-compatible
//! object storage.
//!
//! # Features
//!
//! - **Resumable**: Clients query the committed offset and continue after failures
//! - **Local Files**: Offset-addressed writes into a temp file, renamed on completion
//! - **S3 Compatible**: Single PutObject or multipart sessions driven by the client's chunk size
//! - **Multiple Endpoints**: Each path prefix has its own size limit and backend
//!
//! # Example
//!
//! ```no_run
//! use tus_uploadr::{config::Config, server::Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let server = Server::bind(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod metrics;
pub mod router;
pub mod s3;
pub mod server;
pub mod storage;
pub mod tus;

// Re-export commonly used types
pub use config::Config;
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
