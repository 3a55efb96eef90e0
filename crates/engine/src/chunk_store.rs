//! Deduplicating chunk store.
//!
//! Splits payloads into fixed-size chunks, takes one reference per chunk
//! occurrence and writes each file version's mapping set in one commit.
//!
//! Reference counting always acquires before it writes: a chunk that already
//! exists is reused with a single conditional increment, and a new chunk is
//! inserted with an upsert keyed on its content hash. A purge can only delete
//! rows whose refcount is zero, so an acquire and a purge racing on the same
//! chunk can never both win.

use crate::compression::{EncodedChunk, gzip_if_smaller};
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use bytes::Bytes;
use cirrus_core::chunk;
use cirrus_core::config::EngineConfig;
use cirrus_core::{Chunk, ContentHash};
use cirrus_metadata::models::{ChunkMappingRow, ChunkRow, ChunkState, FileVersionRow, UploadPartRow};
use cirrus_metadata::{MetadataError, MetadataStore};
use cirrus_storage::{BlobStore, StorageError};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

/// Outcome of writing one file version's chunks and mapping set.
#[derive(Debug, Clone)]
pub struct StoredChunks {
    pub file_id: Uuid,
    pub version: i64,
    pub chunk_count: usize,
    pub size_bytes: u64,
    /// Hash of the whole payload.
    pub content_hash: ContentHash,
    /// Chunks written to the blob store by this call.
    pub new_chunks: usize,
    /// Chunks that already existed and were referenced again.
    pub reused_chunks: usize,
}

/// Outcome of retiring a mapping set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetiredChunks {
    pub chunks_released: usize,
    pub chunks_purged: usize,
    pub bytes_reclaimed: u64,
}

/// Chunk storage with content-hash deduplication.
pub struct ChunkStore {
    storage: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    chunk_size: u64,
}

impl ChunkStore {
    pub fn new(
        storage: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            storage,
            metadata,
            chunk_size: config.chunk_size,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Split `payload` and store it as version `version` of `file_id`.
    ///
    /// On failure every reference taken by this call is released again. A
    /// mapping set already present for that version is reported as a version
    /// conflict: another writer claimed the slot.
    #[instrument(skip(self, payload), fields(size = payload.len()))]
    pub async fn store(
        &self,
        file_id: Uuid,
        version: i64,
        payload: &Bytes,
        compress: bool,
    ) -> EngineResult<StoredChunks> {
        if payload.is_empty() {
            return Err(EngineError::Validation(
                "cannot store an empty payload".to_string(),
            ));
        }

        let chunks = chunk::split(payload, self.chunk_size);
        let mut acquired: Vec<ChunkRow> = Vec::with_capacity(chunks.len());
        let mut new_chunks = 0;

        for piece in &chunks {
            match self.acquire(piece, compress).await {
                Ok((row, created)) => {
                    if created {
                        new_chunks += 1;
                    }
                    acquired.push(row);
                }
                Err(e) => {
                    self.release_all(&acquired).await;
                    return Err(e);
                }
            }
        }

        let stored = StoredChunks {
            file_id,
            version,
            chunk_count: chunks.len(),
            size_bytes: payload.len() as u64,
            content_hash: ContentHash::compute(payload),
            new_chunks,
            reused_chunks: chunks.len() - new_chunks,
        };

        let rows = mapping_rows(file_id, version, acquired.iter().map(|c| (c.chunk_id, c.size_bytes)));
        self.insert_mappings(file_id, version, &rows, &acquired).await?;

        tracing::debug!(
            file_id = %file_id,
            version = version,
            chunks = stored.chunk_count,
            new_chunks = stored.new_chunks,
            reused_chunks = stored.reused_chunks,
            "Stored chunk mapping set"
        );
        Ok(stored)
    }

    /// Give `version` of `file_id` the same chunk list as an existing version.
    ///
    /// Every chunk gains one reference per mapping row; no bytes are copied.
    #[instrument(skip(self, source), fields(source_file = %source.file_id, source_version = source.version_number))]
    pub async fn link(
        &self,
        source: &FileVersionRow,
        file_id: Uuid,
        version: i64,
    ) -> EngineResult<StoredChunks> {
        let mappings = self
            .metadata
            .get_mapping_set(source.file_id, source.version_number)
            .await?;
        if mappings.is_empty() {
            return Err(EngineError::NotFound(format!(
                "content of file {} version {} is no longer retained",
                source.file_id, source.version_number
            )));
        }

        let sources: Vec<(Uuid, i64)> = mappings.iter().map(|m| (m.chunk_id, m.size_bytes)).collect();
        let chunk_count = self.link_chunks(file_id, version, &sources).await?;

        let content_hash = ContentHash::from_hex(&source.content_hash)?;
        Ok(StoredChunks {
            file_id,
            version,
            chunk_count,
            size_bytes: source.size_bytes as u64,
            content_hash,
            new_chunks: 0,
            reused_chunks: chunk_count,
        })
    }

    /// Give `version` of `file_id` the chunks of received upload parts, in
    /// part order. The parts keep their own references.
    pub(crate) async fn link_parts(
        &self,
        file_id: Uuid,
        version: i64,
        parts: &[UploadPartRow],
        content_hash: ContentHash,
    ) -> EngineResult<StoredChunks> {
        let sources: Vec<(Uuid, i64)> = parts.iter().map(|p| (p.chunk_id, p.size_bytes)).collect();
        let chunk_count = self.link_chunks(file_id, version, &sources).await?;
        Ok(StoredChunks {
            file_id,
            version,
            chunk_count,
            size_bytes: parts.iter().map(|p| p.size_bytes as u64).sum(),
            content_hash,
            new_chunks: 0,
            reused_chunks: chunk_count,
        })
    }

    /// Store one upload part as a chunk, taking a reference on it.
    pub(crate) async fn store_part(&self, data: Bytes, compress: bool) -> EngineResult<ChunkRow> {
        let (row, _) = self.acquire(&Chunk::new(data), compress).await?;
        Ok(row)
    }

    /// Drop one reference per chunk id, purging chunks that reach zero.
    pub(crate) async fn release(&self, chunk_ids: &[Uuid]) -> RetiredChunks {
        let mut outcome = RetiredChunks::default();
        for &chunk_id in chunk_ids {
            match self.metadata.release_chunk(chunk_id).await {
                Ok(Some(row)) => {
                    outcome.chunks_released += 1;
                    if row.refcount > 0 {
                        continue;
                    }
                    match self.purge(&row).await {
                        Ok(Some(purged)) => {
                            outcome.chunks_purged += 1;
                            outcome.bytes_reclaimed += purged.stored_bytes as u64;
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(chunk_id = %row.chunk_id, error = %e, "Failed to purge released chunk"),
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    chunk_id = %chunk_id,
                    error = %e,
                    "Failed to release chunk reference"
                ),
            }
        }
        outcome
    }

    /// Remove the mapping set of a file version, releasing its chunk
    /// references and purging chunks nothing references any more.
    #[instrument(skip(self))]
    pub async fn delete(&self, file_id: Uuid, version: i64) -> EngineResult<RetiredChunks> {
        let retired = self.metadata.retire_mapping_set(file_id, version).await?;
        if retired.mappings.is_empty() {
            return Err(EngineError::NotFound(format!(
                "chunk mappings for file {file_id} version {version}"
            )));
        }

        let mut outcome = RetiredChunks {
            chunks_released: retired.mappings.len(),
            ..RetiredChunks::default()
        };
        for chunk in &retired.unreferenced {
            // Failures leave a zero-refcount row for the reaper
            match self.purge(chunk).await {
                Ok(Some(row)) => {
                    outcome.chunks_purged += 1;
                    outcome.bytes_reclaimed += row.stored_bytes as u64;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    chunk_id = %chunk.chunk_id,
                    error = %e,
                    "Failed to purge unreferenced chunk"
                ),
            }
        }

        tracing::debug!(
            file_id = %file_id,
            version = version,
            released = outcome.chunks_released,
            purged = outcome.chunks_purged,
            "Retired chunk mapping set"
        );
        Ok(outcome)
    }

    /// Delete a chunk row and its blob if its refcount is zero.
    ///
    /// Returns `None` when the chunk was referenced again (or is already
    /// gone). The row goes first; a blob left behind by a failed delete is
    /// unreachable, never a dangling reference.
    pub async fn purge(&self, chunk: &ChunkRow) -> EngineResult<Option<ChunkRow>> {
        let Some(row) = self
            .metadata
            .delete_chunk_if_unreferenced(chunk.chunk_id)
            .await?
        else {
            return Ok(None);
        };

        self.delete_blob(&row.storage_key).await;
        metrics::CHUNKS_PURGED.inc();
        tracing::debug!(
            chunk_hash = %row.content_hash,
            stored_bytes = row.stored_bytes,
            "Purged chunk"
        );
        Ok(Some(row))
    }

    /// Take one reference on the chunk holding this content, writing it first
    /// if no such chunk exists. Returns the row and whether it was created.
    async fn acquire(&self, piece: &Chunk, compress: bool) -> EngineResult<(ChunkRow, bool)> {
        let hash_hex = piece.hash.to_hex();
        let now = OffsetDateTime::now_utc();

        if let Some(row) = self.metadata.acquire_chunk_by_hash(&hash_hex, now).await? {
            metrics::CHUNKS_DEDUPLICATED.inc();
            tracing::debug!(chunk_hash = %hash_hex, "Reusing existing chunk");
            return Ok((row, false));
        }

        let encoded = if compress {
            gzip_if_smaller(&piece.data)
                .await
                .map_err(|e| EngineError::Internal(format!("chunk compression failed: {e}")))?
        } else {
            EncodedChunk {
                data: piece.data.clone(),
                compressed: false,
            }
        };

        let chunk_id = Uuid::new_v4();
        let key_hint = piece.hash.storage_key_hint(chunk_id, encoded.compressed);
        let stored_bytes = encoded.data.len() as u64;
        let storage_key = self.storage.put(&key_hint, encoded.data).await?;

        let candidate = ChunkRow {
            chunk_id,
            content_hash: hash_hex.clone(),
            storage_key: storage_key.clone(),
            size_bytes: piece.size() as i64,
            stored_bytes: stored_bytes as i64,
            compressed: encoded.compressed,
            refcount: 1,
            state: ChunkState::Pending.as_str().to_string(),
            created_at: now,
            last_referenced_at: now,
        };

        let row = match self.metadata.insert_chunk_or_acquire(&candidate).await {
            Ok(row) => row,
            Err(e) => {
                self.delete_blob(&storage_key).await;
                return Err(e.into());
            }
        };

        if row.chunk_id != chunk_id {
            // Another writer inserted this content first; its row now carries our reference
            self.delete_blob(&storage_key).await;
            metrics::CHUNKS_DEDUPLICATED.inc();
            tracing::debug!(chunk_hash = %hash_hex, "Lost chunk insert race, reusing winner");
            return Ok((row, false));
        }

        metrics::CHUNKS_STORED.inc();
        metrics::BYTES_STORED.inc_by(stored_bytes);
        Ok((row, true))
    }

    async fn insert_mappings(
        &self,
        file_id: Uuid,
        version: i64,
        rows: &[ChunkMappingRow],
        acquired: &[ChunkRow],
    ) -> EngineResult<()> {
        let Err(e) = self.metadata.insert_mapping_set(rows).await else {
            return Ok(());
        };
        self.release_all(acquired).await;

        match e {
            MetadataError::SlotTaken { .. } => {
                let actual = self
                    .metadata
                    .get_file(file_id)
                    .await?
                    .map_or(0, |file| file.current_version);
                tracing::debug!(file_id = %file_id, version = version, current = actual, "Mapping set slot taken");
                metrics::VERSION_CONFLICTS.inc();
                Err(EngineError::VersionConflict {
                    file_id,
                    expected: version - 1,
                    actual,
                })
            }
            MetadataError::UnknownChunk(chunk_id) => {
                // The reaper reclaimed a chunk this upload still held
                tracing::warn!(file_id = %file_id, version = version, chunk_id = %chunk_id, "Chunk vanished before mapping set was written");
                Err(EngineError::Internal(format!(
                    "chunk {chunk_id} was reclaimed while file {file_id} version {version} was uploading; retry the upload"
                )))
            }
            other => Err(other.into()),
        }
    }

    async fn release_all(&self, acquired: &[ChunkRow]) {
        let ids: Vec<Uuid> = acquired.iter().map(|c| c.chunk_id).collect();
        self.release(&ids).await;
    }

    /// Take one more reference on each existing chunk and write them as the
    /// mapping set of `version`. Returns the number of mappings.
    async fn link_chunks(
        &self,
        file_id: Uuid,
        version: i64,
        sources: &[(Uuid, i64)],
    ) -> EngineResult<usize> {
        let now = OffsetDateTime::now_utc();
        let mut acquired: Vec<ChunkRow> = Vec::with_capacity(sources.len());
        for &(chunk_id, _) in sources {
            match self.metadata.acquire_chunk(chunk_id, now).await {
                Ok(Some(row)) => acquired.push(row),
                Ok(None) => {
                    self.release_all(&acquired).await;
                    return Err(EngineError::NotFound(format!("chunk {chunk_id}")));
                }
                Err(e) => {
                    self.release_all(&acquired).await;
                    return Err(e.into());
                }
            }
        }

        let rows = mapping_rows(file_id, version, sources.iter().copied());
        self.insert_mappings(file_id, version, &rows, &acquired).await?;
        Ok(rows.len())
    }

    /// Best-effort blob delete. A missing blob counts as deleted.
    async fn delete_blob(&self, key: &str) {
        match self.storage.delete(key).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => tracing::warn!(
                key = %key,
                error = %e,
                "Failed to delete chunk blob (orphaned object, metadata already gone)"
            ),
        }
    }
}

/// Mapping rows with running sequence numbers and offsets.
fn mapping_rows(
    file_id: Uuid,
    version: i64,
    chunks: impl Iterator<Item = (Uuid, i64)>,
) -> Vec<ChunkMappingRow> {
    let now = OffsetDateTime::now_utc();
    let mut offset = 0;
    chunks
        .enumerate()
        .map(|(sequence, (chunk_id, size))| {
            let row = ChunkMappingRow {
                file_id,
                version_number: version,
                sequence_number: sequence as i64,
                chunk_id,
                offset_in_file: offset,
                size_bytes: size,
                created_at: now,
            };
            offset += size;
            row
        })
        .collect()
}
