//! In-process blob backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{BlobStore, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

/// Blob store held in a concurrent map. Contents are lost on drop.
#[derive(Default)]
pub struct MemoryBackend {
    blobs: DashMap<String, Bytes>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Total bytes currently stored.
    pub fn total_bytes(&self) -> u64 {
        self.blobs.iter().map(|e| e.value().len() as u64).sum()
    }

    /// Snapshot of the stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.blobs.contains_key(key))
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        validate_key(key)?;
        self.blobs
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key_hint: &str, data: Bytes) -> StorageResult<String> {
        validate_key(key_hint)?;
        self.blobs.insert(key_hint.to_string(), data);
        Ok(key_hint.to_string())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.blobs
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip_and_accounting() {
        let backend = MemoryBackend::new();
        assert!(backend.is_empty());

        backend
            .put("chunks/a", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        backend
            .put("chunks/b", Bytes::from_static(b"de"))
            .await
            .unwrap();
        assert_eq!(backend.len(), 2);
        assert_eq!(backend.total_bytes(), 5);
        assert_eq!(backend.keys(), vec!["chunks/a", "chunks/b"]);

        backend.delete("chunks/a").await.unwrap();
        assert!(!backend.exists("chunks/a").await.unwrap());
        assert!(matches!(
            backend.delete("chunks/a").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
