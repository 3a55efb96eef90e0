//! Engine test utilities.

use super::fixtures::TEST_CHUNK_SIZE;
use cirrus_core::config::{CompressionConfig, EngineConfig, GcConfig};
use cirrus_engine::{Engine, Reaper};
use cirrus_metadata::{MetadataStore, SqliteStore};
use cirrus_storage::{BlobStore, MemoryBackend};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use time::OffsetDateTime;

/// An engine over an in-memory blob store and a temporary SQLite database.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestEngine {
    pub engine: Engine,
    pub blobs: Arc<MemoryBackend>,
    sqlite: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEngine {
    /// Small chunks, gzip enabled.
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::with_chunk_size(TEST_CHUNK_SIZE as u64)).await
    }

    /// Small chunks, compression disabled, so stored bytes equal chunk bytes.
    pub async fn uncompressed() -> Self {
        Self::with_config(EngineConfig {
            chunk_size: TEST_CHUNK_SIZE as u64,
            compression: CompressionConfig::None,
            ..EngineConfig::default()
        })
        .await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let blobs = Arc::new(MemoryBackend::new());
        Self::build(blobs.clone(), blobs, config).await
    }

    /// Engine whose blob store is `storage`; `blobs` is only used for inspection.
    pub async fn with_storage(storage: Arc<dyn BlobStore>, config: EngineConfig) -> Self {
        Self::build(storage, Arc::new(MemoryBackend::new()), config).await
    }

    async fn build(
        storage: Arc<dyn BlobStore>,
        blobs: Arc<MemoryBackend>,
        config: EngineConfig,
    ) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let sqlite = Arc::new(
            SqliteStore::new(temp_dir.path().join("metadata.db"), Duration::from_secs(5))
                .await
                .expect("Failed to create metadata store"),
        );
        let metadata: Arc<dyn MetadataStore> = sqlite.clone();
        let engine = Engine::new(storage, metadata, config).expect("Failed to create engine");

        Self {
            engine,
            blobs,
            sqlite,
            _temp_dir: temp_dir,
        }
    }

    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.engine.metadata().clone()
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite.pool()
    }

    /// Number of blobs currently stored.
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Reaper with a one-hour grace period.
    pub fn reaper(&self, dry_run: bool) -> Reaper {
        self.engine.reaper(GcConfig {
            dry_run,
            ..GcConfig::default()
        })
    }

    /// Push every timestamp the reaper looks at two hours into the past.
    pub async fn age_everything(&self) {
        let past = OffsetDateTime::now_utc() - time::Duration::hours(2);
        sqlx::query("UPDATE chunks SET last_referenced_at = ?")
            .bind(past)
            .execute(self.pool())
            .await
            .expect("Failed to age chunks");
        sqlx::query("UPDATE chunk_mappings SET created_at = ?")
            .bind(past)
            .execute(self.pool())
            .await
            .expect("Failed to age mappings");
    }

    /// Make every upload session expired.
    pub async fn expire_sessions(&self) {
        sqlx::query("UPDATE upload_sessions SET expires_at = ?")
            .bind(OffsetDateTime::now_utc() - time::Duration::minutes(1))
            .execute(self.pool())
            .await
            .expect("Failed to expire sessions");
    }

    /// Refcount of the chunk holding `data`, if any.
    pub async fn refcount_of(&self, data: &[u8]) -> Option<i64> {
        self.metadata()
            .get_chunk_by_hash(&super::fixtures::sha256_hex(data))
            .await
            .expect("chunk lookup failed")
            .map(|c| c.refcount)
    }
}
