//! Blob storage abstraction and backends for Cirrus.
//!
//! Chunk bytes live in a [`BlobStore`]; the metadata store only records the
//! key each chunk was written under. Backends: local filesystem and in-memory.

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, memory::MemoryBackend};
pub use error::{StorageError, StorageResult};
pub use traits::BlobStore;

use cirrus_core::config::StorageConfig;
use std::sync::Arc;

/// Create a blob store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn BlobStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            tracing::info!(root = %path.display(), "Using filesystem blob storage");
            Ok(Arc::new(backend))
        }
        StorageConfig::Memory => {
            tracing::warn!("Using in-memory blob storage; contents are lost on exit");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}
