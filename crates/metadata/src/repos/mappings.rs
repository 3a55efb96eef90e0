//! Chunk mapping repository.

use crate::error::MetadataResult;
use crate::models::{ChunkMappingRow, ChunkRow, MappingSetRef};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for per-version chunk mapping sets.
///
/// A mapping set is written whole and removed whole; rows are never edited.
#[async_trait]
pub trait MappingRepo: Send + Sync {
    /// Insert the complete mapping set of one file version in one transaction.
    ///
    /// The rows must belong to a single `(file_id, version_number)`, have
    /// sequence numbers `0..n` in order and contiguous offsets starting at 0.
    /// Fails with `Constraint` if the set breaks these rules, `SlotTaken` if
    /// that version already has a mapping set or a committed version record,
    /// and `UnknownChunk` if a mapped chunk row is gone.
    async fn insert_mapping_set(&self, rows: &[ChunkMappingRow]) -> MetadataResult<()>;

    /// Mapping set of a file version ordered by sequence number. Empty if none.
    async fn get_mapping_set(
        &self,
        file_id: Uuid,
        version_number: i64,
    ) -> MetadataResult<Vec<ChunkMappingRow>>;

    /// Remove a mapping set and release one chunk reference per removed row,
    /// in one transaction.
    async fn retire_mapping_set(
        &self,
        file_id: Uuid,
        version_number: i64,
    ) -> MetadataResult<RetiredMappingSet>;

    /// Versions of a file that still have a mapping set, ascending.
    async fn list_mapped_versions(&self, file_id: Uuid) -> MetadataResult<Vec<i64>>;

    /// Mapping sets with no version record whose newest row predates `older_than`.
    async fn list_orphan_mapping_sets(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<MappingSetRef>>;
}

/// Outcome of retiring a mapping set.
#[derive(Debug, Clone, Default)]
pub struct RetiredMappingSet {
    /// The removed mapping rows.
    pub mappings: Vec<ChunkMappingRow>,
    /// Chunks whose refcount dropped to zero, ready to purge.
    pub unreferenced: Vec<ChunkRow>,
}
