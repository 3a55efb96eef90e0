//! Chunk repository.
//!
//! Reference counting is done with single conditional statements so that a
//! concurrent acquire and purge of the same chunk can never both succeed.

use crate::error::MetadataResult;
use crate::models::ChunkRow;
use async_trait::async_trait;
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for chunk operations.
#[async_trait]
pub trait ChunkRepo: Send + Sync {
    /// Get a chunk by id.
    async fn get_chunk(&self, chunk_id: Uuid) -> MetadataResult<Option<ChunkRow>>;

    /// Get a chunk by content hash.
    async fn get_chunk_by_hash(&self, content_hash: &str) -> MetadataResult<Option<ChunkRow>>;

    /// Get multiple chunks by id in as few queries as possible.
    ///
    /// Chunks that don't exist are simply not included in the result.
    async fn get_chunks_batch(&self, chunk_ids: &[Uuid]) -> MetadataResult<HashMap<Uuid, ChunkRow>>;

    /// Take one reference on the chunk with this content hash, if it exists.
    ///
    /// Returns the updated row, or `None` when no chunk has this hash.
    async fn acquire_chunk_by_hash(
        &self,
        content_hash: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<ChunkRow>>;

    /// Take one reference on a chunk by id. `None` if the chunk is gone.
    async fn acquire_chunk(
        &self,
        chunk_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<ChunkRow>>;

    /// Insert a new chunk with one reference, or take a reference on the row
    /// that already holds its content hash.
    ///
    /// The returned row is the winner: if its `chunk_id` differs from the
    /// candidate's, another writer inserted the hash first and the caller's
    /// blob is redundant.
    async fn insert_chunk_or_acquire(&self, chunk: &ChunkRow) -> MetadataResult<ChunkRow>;

    /// Drop one reference (never below zero). Returns the updated row.
    async fn release_chunk(&self, chunk_id: Uuid) -> MetadataResult<Option<ChunkRow>>;

    /// Delete the chunk row only if nothing references it.
    ///
    /// Returns the deleted row so the caller can delete its blob afterwards.
    async fn delete_chunk_if_unreferenced(&self, chunk_id: Uuid) -> MetadataResult<Option<ChunkRow>>;

    /// Chunks with a zero refcount last referenced before `older_than`.
    async fn list_unreferenced_chunks(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<ChunkRow>>;

    /// Pending chunks no mapping or upload part references, last referenced
    /// before `older_than`.
    ///
    /// These are leftovers of uploads that died between writing chunks and
    /// writing their mapping set.
    async fn list_stale_pending_chunks(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<ChunkRow>>;

    /// Delete a stale pending chunk, re-checking every condition of
    /// [`ChunkRepo::list_stale_pending_chunks`] atomically.
    async fn delete_stale_pending_chunk(
        &self,
        chunk_id: Uuid,
        older_than: OffsetDateTime,
    ) -> MetadataResult<Option<ChunkRow>>;

    /// Get total chunk count and size.
    async fn get_chunk_stats(&self) -> MetadataResult<ChunkStats>;
}

/// Chunk statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStats {
    /// Total number of chunks.
    pub count: u64,
    /// Total uncompressed size in bytes.
    pub total_size: u64,
    /// Total stored (possibly compressed) size in bytes.
    pub stored_size: u64,
    /// Number of chunks with refcount == 0.
    pub unreferenced_count: u64,
    /// Number of chunks still pending.
    pub pending_count: u64,
}
