//! Scheduled sweep of storage left behind by interrupted operations.
//!
//! Upload sessions past their own expiry are removed first, releasing the
//! parts they hold. Three kinds of leftovers are then reclaimed, each only
//! once it is older than the grace period so in-flight uploads are never
//! touched:
//! - mapping sets with no version record (uploads that died before commit,
//!   files deleted before their sets were retired),
//! - pending chunks nothing maps (uploads that died before their mapping
//!   set was written),
//! - chunks whose refcount is zero but whose purge failed.

use crate::chunk_store::ChunkStore;
use crate::error::EngineResult;
use crate::files::expire_sessions;
use cirrus_core::config::GcConfig;
use cirrus_metadata::MetadataStore;
use cirrus_storage::{BlobStore, StorageError};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::instrument;

/// Counters from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub sessions_expired: u64,
    pub mapping_sets_retired: u64,
    pub chunks_purged: u64,
    pub bytes_reclaimed: u64,
    pub errors: u64,
}

pub struct Reaper {
    chunks: Arc<ChunkStore>,
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn BlobStore>,
    config: GcConfig,
}

impl Reaper {
    pub fn new(
        chunks: Arc<ChunkStore>,
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn BlobStore>,
        config: GcConfig,
    ) -> Self {
        Self {
            chunks,
            metadata,
            storage,
            config,
        }
    }

    /// Sweep everything older than the configured grace period.
    pub async fn run_once(&self) -> EngineResult<SweepStats> {
        self.sweep(OffsetDateTime::now_utc() - self.config.grace_period())
            .await
    }

    /// Sweep leftovers last touched before `older_than`.
    #[instrument(skip(self), fields(dry_run = self.config.dry_run))]
    pub async fn sweep(&self, older_than: OffsetDateTime) -> EngineResult<SweepStats> {
        let mut stats = SweepStats::default();

        self.expire_upload_sessions(&mut stats).await?;
        self.retire_orphan_mapping_sets(older_than, &mut stats)
            .await?;
        self.purge_stale_pending_chunks(older_than, &mut stats)
            .await?;
        self.purge_unreferenced_chunks(older_than, &mut stats)
            .await?;

        tracing::info!(
            sessions_expired = stats.sessions_expired,
            mapping_sets_retired = stats.mapping_sets_retired,
            chunks_purged = stats.chunks_purged,
            bytes_reclaimed = stats.bytes_reclaimed,
            errors = stats.errors,
            dry_run = self.config.dry_run,
            "Sweep finished"
        );
        Ok(stats)
    }

    /// Run sweeps on the configured interval until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.auto_schedule_interval();
        tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "Reaper scheduled");
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = self.run_once().await {
                    tracing::error!(error = %e, "Sweep failed");
                }
            }
        })
    }

    /// Sessions expire on their own clock, not the grace cutoff.
    async fn expire_upload_sessions(&self, stats: &mut SweepStats) -> EngineResult<()> {
        let now = OffsetDateTime::now_utc();
        if self.config.dry_run {
            let expired = self
                .metadata
                .list_expired_sessions(now, self.config.batch_size)
                .await?;
            stats.sessions_expired += expired.len() as u64;
            return Ok(());
        }

        let expired = expire_sessions(
            self.metadata.as_ref(),
            &self.chunks,
            now,
            self.config.batch_size,
        )
        .await?;
        stats.sessions_expired += expired.sessions;
        stats.chunks_purged += expired.chunks_purged;
        stats.bytes_reclaimed += expired.bytes_reclaimed;
        Ok(())
    }

    async fn retire_orphan_mapping_sets(
        &self,
        older_than: OffsetDateTime,
        stats: &mut SweepStats,
    ) -> EngineResult<()> {
        loop {
            let orphans = self
                .metadata
                .list_orphan_mapping_sets(older_than, self.config.batch_size)
                .await?;
            if orphans.is_empty() {
                return Ok(());
            }

            let mut progressed = false;
            for set in &orphans {
                if self.config.dry_run {
                    stats.mapping_sets_retired += 1;
                    continue;
                }
                match self.chunks.delete(set.file_id, set.version_number).await {
                    Ok(retired) => {
                        progressed = true;
                        stats.mapping_sets_retired += 1;
                        stats.chunks_purged += retired.chunks_purged as u64;
                        stats.bytes_reclaimed += retired.bytes_reclaimed;
                    }
                    Err(e) => {
                        tracing::warn!(
                            file_id = %set.file_id,
                            version = set.version_number,
                            error = %e,
                            "Failed to retire orphaned mapping set"
                        );
                        stats.errors += 1;
                    }
                }
            }

            if !progressed || orphans.len() < self.config.batch_size as usize {
                return Ok(());
            }
        }
    }

    async fn purge_stale_pending_chunks(
        &self,
        older_than: OffsetDateTime,
        stats: &mut SweepStats,
    ) -> EngineResult<()> {
        loop {
            let stale = self
                .metadata
                .list_stale_pending_chunks(older_than, self.config.batch_size)
                .await?;
            if stale.is_empty() {
                return Ok(());
            }

            let mut progressed = false;
            for chunk in &stale {
                if self.config.dry_run {
                    stats.chunks_purged += 1;
                    stats.bytes_reclaimed += chunk.stored_bytes as u64;
                    continue;
                }
                // Re-checks every condition; a chunk acquired since listing survives
                match self
                    .metadata
                    .delete_stale_pending_chunk(chunk.chunk_id, older_than)
                    .await
                {
                    Ok(Some(row)) => {
                        progressed = true;
                        stats.chunks_purged += 1;
                        stats.bytes_reclaimed += row.stored_bytes as u64;
                        self.delete_blob(&row.storage_key, stats).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(chunk_id = %chunk.chunk_id, error = %e, "Failed to purge stale chunk");
                        stats.errors += 1;
                    }
                }
            }

            if !progressed || stale.len() < self.config.batch_size as usize {
                return Ok(());
            }
        }
    }

    async fn purge_unreferenced_chunks(
        &self,
        older_than: OffsetDateTime,
        stats: &mut SweepStats,
    ) -> EngineResult<()> {
        loop {
            let unreferenced = self
                .metadata
                .list_unreferenced_chunks(older_than, self.config.batch_size)
                .await?;
            if unreferenced.is_empty() {
                return Ok(());
            }

            let mut progressed = false;
            for chunk in &unreferenced {
                if self.config.dry_run {
                    stats.chunks_purged += 1;
                    stats.bytes_reclaimed += chunk.stored_bytes as u64;
                    continue;
                }
                match self.chunks.purge(chunk).await {
                    Ok(Some(row)) => {
                        progressed = true;
                        stats.chunks_purged += 1;
                        stats.bytes_reclaimed += row.stored_bytes as u64;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(chunk_id = %chunk.chunk_id, error = %e, "Failed to purge unreferenced chunk");
                        stats.errors += 1;
                    }
                }
            }

            if !progressed || unreferenced.len() < self.config.batch_size as usize {
                return Ok(());
            }
        }
    }

    async fn delete_blob(&self, key: &str, stats: &mut SweepStats) {
        match self.storage.delete(key).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Failed to delete chunk blob (orphaned object created, metadata already deleted)"
                );
                stats.errors += 1;
            }
        }
    }
}
