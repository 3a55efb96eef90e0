//! Differential sync.
//!
//! The server hands out the chunk signatures of a file's current version.
//! The client splits its new content the same way and uploads the full
//! ordered hash list plus only the chunks the server does not hold. The
//! server rebuilds the content from supplied and reused chunks and stores it
//! as the next version.

use crate::assembler::FileAssembler;
use crate::chunk_store::ChunkStore;
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::writer::{VersionWriter, WriteTarget, ensure_regular_file, load_file};
use bytes::{Bytes, BytesMut};
use cirrus_core::{ChunkHash, ChunkSignature, DeltaRequest, SignatureSet};
use cirrus_metadata::MetadataStore;
use cirrus_metadata::models::{ChunkRow, FileRow};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

pub struct DiffSyncEngine {
    metadata: Arc<dyn MetadataStore>,
    chunks: Arc<ChunkStore>,
    assembler: FileAssembler,
    writer: VersionWriter,
}

impl DiffSyncEngine {
    pub(crate) fn new(
        metadata: Arc<dyn MetadataStore>,
        chunks: Arc<ChunkStore>,
        assembler: FileAssembler,
        writer: VersionWriter,
    ) -> Self {
        Self {
            metadata,
            chunks,
            assembler,
            writer,
        }
    }

    /// Chunk signatures of the file's current version, in order.
    #[instrument(skip(self))]
    pub async fn get_signatures(&self, file_id: Uuid) -> EngineResult<SignatureSet> {
        let file = load_file(self.metadata.as_ref(), file_id).await?;
        ensure_regular_file(&file)?;

        let plan = self
            .assembler
            .load_plan(file_id, file.current_version)
            .await?;
        let signatures = plan
            .iter()
            .map(|(mapping, chunk)| {
                Ok(ChunkSignature {
                    index: mapping.sequence_number as u32,
                    hash: ChunkHash::from_hex(&chunk.content_hash)?,
                    size: mapping.size_bytes as u64,
                    offset: mapping.offset_in_file as u64,
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(SignatureSet {
            file_id,
            version: file.current_version,
            chunk_size: self.chunks.chunk_size(),
            total_size: file.size_bytes as u64,
            signatures,
        })
    }

    /// Rebuild the file from a delta and commit it as the next version.
    ///
    /// Every supplied chunk must hash to the value declared for its index;
    /// every other index must name a chunk of the current version. Once the
    /// new version is committed, the previous version's mapping set is
    /// retired: its history record stays, its content is released.
    #[instrument(skip(self, delta), fields(supplied = delta.chunks.len()))]
    pub async fn apply_delta(&self, file_id: Uuid, delta: &DeltaRequest) -> EngineResult<FileRow> {
        let file = load_file(self.metadata.as_ref(), file_id).await?;
        ensure_regular_file(&file)?;
        self.writer.check_expected(&file, delta.base_version)?;

        let chunk_count = delta.chunk_count()?;

        let plan = self
            .assembler
            .load_plan(file_id, file.current_version)
            .await?;
        let reusable: HashMap<String, ChunkRow> = plan
            .into_iter()
            .map(|(_, chunk)| (chunk.content_hash.clone(), chunk))
            .collect();

        let mut payload = BytesMut::new();
        let mut supplied = 0u64;
        let mut reused = 0u64;

        for index in 0..chunk_count {
            // chunk_count() guarantees a hash for every index below the count
            let declared = delta.chunk_hashes.get(&index).ok_or_else(|| {
                EngineError::Validation(format!("missing hash for chunk index {index}"))
            })?;

            let data: Bytes = if let Some(data) = delta.chunks.get(&index) {
                let actual = ChunkHash::compute(data);
                if actual != *declared {
                    return Err(EngineError::Validation(format!(
                        "chunk {index} hashes to {actual}, declared {declared}"
                    )));
                }
                supplied += 1;
                data.clone()
            } else if let Some(chunk) = reusable.get(&declared.to_hex()) {
                reused += 1;
                self.assembler.read_chunk(chunk).await?
            } else {
                return Err(EngineError::Validation(format!(
                    "chunk {index} ({declared}) was not supplied and is not part of version {}",
                    file.current_version
                )));
            };

            payload.extend_from_slice(&data);
        }

        let payload = payload.freeze();
        let previous = file.current_version;
        let updated = self
            .writer
            .write(&WriteTarget::next_version_of(&file), &payload)
            .await?;

        metrics::DELTA_CHUNKS_APPLIED.inc_by(supplied);
        metrics::DELTA_CHUNKS_REUSED.inc_by(reused);

        // The new mapping set is committed; only now may the old one go
        if let Err(e) = self.chunks.delete(file_id, previous).await {
            tracing::warn!(
                file_id = %file_id,
                version = previous,
                error = %e,
                "Failed to retire superseded mapping set"
            );
        }

        tracing::info!(
            file_id = %file_id,
            version = updated.current_version,
            supplied_chunks = supplied,
            reused_chunks = reused,
            "Applied delta"
        );
        Ok(updated)
    }
}
