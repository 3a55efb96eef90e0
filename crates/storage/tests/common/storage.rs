//! Storage test utilities.

use cirrus_storage::{BlobStore, FilesystemBackend, MemoryBackend, StorageResult};
use std::sync::Arc;
use tempfile::TempDir;

/// A test blob store that cleans up on drop.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestStorage {
    pub backend: Arc<dyn BlobStore>,
    _temp_dir: Option<TempDir>,
}

#[allow(dead_code)]
impl TestStorage {
    /// Filesystem backend in a temporary directory.
    pub async fn filesystem() -> StorageResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let backend = FilesystemBackend::new(temp_dir.path()).await?;

        Ok(Self {
            backend: Arc::new(backend),
            _temp_dir: Some(temp_dir),
        })
    }

    /// In-memory backend.
    pub fn memory() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            _temp_dir: None,
        }
    }

    /// Both backends, for running one scenario against each.
    pub async fn all() -> Vec<Self> {
        vec![
            Self::filesystem().await.expect("Failed to create storage"),
            Self::memory(),
        ]
    }

    pub fn store(&self) -> Arc<dyn BlobStore> {
        self.backend.clone()
    }
}
