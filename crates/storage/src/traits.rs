//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Durable, content-opaque blob storage.
///
/// The engine never interprets blob contents; it only keeps the key returned
/// by [`BlobStore::put`] next to the chunk record that owns the blob.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Check if a blob exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get a blob's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Store a blob atomically and return the key it can be read back with.
    ///
    /// `key_hint` is a relative, `/`-separated path. Backends may return it
    /// unchanged or map it to a key of their own.
    async fn put(&self, key_hint: &str, data: Bytes) -> StorageResult<String>;

    /// Delete a blob. Fails with `NotFound` if it does not exist.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Check that the backend is reachable and writable.
    async fn health_check(&self) -> StorageResult<()>;

    /// Static identifier for the backend type, used in logs.
    fn backend_name(&self) -> &'static str;
}

/// Validate a relative blob key shared by all backends.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    use crate::error::StorageError;
    use std::path::{Component, Path};

    if key.is_empty() {
        return Err(StorageError::InvalidKey("empty key".to_string()));
    }
    if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
        return Err(StorageError::InvalidKey(format!(
            "path traversal not allowed: {key}"
        )));
    }
    if !Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidKey(format!(
            "contains unsafe path component: {key}"
        )));
    }
    Ok(())
}
