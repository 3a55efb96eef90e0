use async_trait::async_trait;
use bytes::Bytes;
use cirrus_storage::{BlobStore, MemoryBackend, StorageError, StorageResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Barrier;

/// Blob store that fails every put after the first `allowed_puts`.
///
/// Reads and deletes go to an inner memory store so cleanup can be observed.
#[allow(dead_code)]
pub struct FailingBlobStore {
    pub inner: MemoryBackend,
    allowed_puts: usize,
    puts: AtomicUsize,
}

#[allow(dead_code)]
impl FailingBlobStore {
    pub fn new(allowed_puts: usize) -> Self {
        Self {
            inner: MemoryBackend::new(),
            allowed_puts,
            puts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BlobStore for FailingBlobStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn put(&self, key_hint: &str, data: Bytes) -> StorageResult<String> {
        if self.puts.fetch_add(1, Ordering::SeqCst) >= self.allowed_puts {
            return Err(StorageError::Unavailable("injected put failure".to_string()));
        }
        self.inner.put(key_hint, data).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}

/// Blob store whose puts each meet a second party at a barrier twice: once
/// on arrival and once before writing.
///
/// Two writers putting at the same time release each other. A test can also
/// act as the second party to hold a single writer inside `put`.
#[allow(dead_code)]
pub struct RendezvousBlobStore {
    pub inner: MemoryBackend,
    barrier: Barrier,
}

#[allow(dead_code)]
impl RendezvousBlobStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            barrier: Barrier::new(2),
        }
    }

    /// Meet a writer at the barrier.
    pub async fn meet(&self) {
        self.barrier.wait().await;
    }
}

#[async_trait]
impl BlobStore for RendezvousBlobStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn put(&self, key_hint: &str, data: Bytes) -> StorageResult<String> {
        self.barrier.wait().await;
        self.barrier.wait().await;
        self.inner.put(key_hint, data).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "rendezvous"
    }
}
