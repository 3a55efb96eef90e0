//! Reassembly of file versions from their chunk mapping sets.

use crate::compression::gunzip;
use crate::error::{EngineError, EngineResult};
use bytes::{Bytes, BytesMut};
use cirrus_core::{Chunk, ChunkHash, ContentHash};
use cirrus_metadata::MetadataStore;
use cirrus_metadata::models::{ChunkMappingRow, ChunkRow};
use cirrus_storage::BlobStore;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Stream of file content, one item per chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = EngineResult<Bytes>> + Send>>;

/// Reads file versions back out of the chunk store.
#[derive(Clone)]
pub struct FileAssembler {
    storage: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
}

impl FileAssembler {
    pub fn new(storage: Arc<dyn BlobStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { storage, metadata }
    }

    /// Reconstruct the full content of a file version.
    #[instrument(skip(self))]
    pub async fn assemble(&self, file_id: Uuid, version: i64) -> EngineResult<Bytes> {
        let plan = self.load_plan(file_id, version).await?;
        let total: i64 = plan.iter().map(|(m, _)| m.size_bytes).sum();

        let mut out = BytesMut::with_capacity(total as usize);
        for (_, chunk) in &plan {
            out.extend_from_slice(&self.read_chunk(chunk).await?);
        }
        Ok(out.freeze())
    }

    /// Stream the content of a file version chunk by chunk.
    ///
    /// The mapping set is resolved up front, so a missing version fails here
    /// rather than mid-stream.
    pub async fn stream(&self, file_id: Uuid, version: i64) -> EngineResult<ByteStream> {
        let plan = self.load_plan(file_id, version).await?;
        let this = self.clone();

        Ok(Box::pin(async_stream::try_stream! {
            for (_, chunk) in plan {
                let data = this.read_chunk(&chunk).await?;
                yield data;
            }
        }))
    }

    /// Reassemble a version and compare it with its recorded size and hash.
    #[instrument(skip(self))]
    pub async fn verify(&self, file_id: Uuid, version: i64) -> EngineResult<()> {
        let record = self
            .metadata
            .get_version(file_id, version)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("file {file_id} version {version}")))?;

        let plan = self.load_plan(file_id, version).await?;
        let mut hasher = ContentHash::hasher();
        let mut size = 0u64;
        for (_, chunk) in &plan {
            let data = self.read_chunk(chunk).await?;
            size += data.len() as u64;
            hasher.update(&data);
        }
        let actual = hasher.finalize().to_hex();

        if size != record.size_bytes as u64 || actual != record.content_hash {
            return Err(EngineError::Validation(format!(
                "file {file_id} version {version} reassembles to {size} bytes with hash {actual}, \
                 recorded {} bytes with hash {}",
                record.size_bytes, record.content_hash
            )));
        }
        Ok(())
    }

    /// Fetch one chunk, decompress it and check it against its content hash.
    pub(crate) async fn read_chunk(&self, chunk: &ChunkRow) -> EngineResult<Bytes> {
        let raw = self.storage.get(&chunk.storage_key).await?;
        let data = if chunk.compressed {
            gunzip(&raw).await.map_err(|e| {
                EngineError::Internal(format!("chunk {} failed to decompress: {e}", chunk.chunk_id))
            })?
        } else {
            raw
        };

        let expected = ChunkHash::from_hex(&chunk.content_hash)
            .map_err(|e| EngineError::Internal(format!("chunk {}: {e}", chunk.chunk_id)))?;
        let piece = Chunk::new(data);
        piece
            .verify(&expected)
            .map_err(|e| EngineError::Internal(format!("chunk {} is corrupt: {e}", chunk.chunk_id)))?;
        Ok(piece.data)
    }

    /// Resolve the ordered chunk list of a version, checking that it covers
    /// the file without gaps.
    pub(crate) async fn load_plan(
        &self,
        file_id: Uuid,
        version: i64,
    ) -> EngineResult<Vec<(ChunkMappingRow, ChunkRow)>> {
        let mappings = self.metadata.get_mapping_set(file_id, version).await?;
        if mappings.is_empty() {
            return Err(EngineError::NotFound(format!(
                "no chunk mappings for file {file_id} version {version}"
            )));
        }

        let mut expected_offset = 0;
        for (i, mapping) in mappings.iter().enumerate() {
            if mapping.sequence_number != i as i64 || mapping.offset_in_file != expected_offset {
                return Err(EngineError::NotFound(format!(
                    "chunk mappings for file {file_id} version {version} are incomplete at sequence {i}"
                )));
            }
            expected_offset += mapping.size_bytes;
        }

        let ids: Vec<Uuid> = mappings.iter().map(|m| m.chunk_id).collect();
        let chunks = self.metadata.get_chunks_batch(&ids).await?;

        mappings
            .into_iter()
            .map(|mapping| {
                // Repeated chunks appear once in the batch result
                let chunk = chunks
                    .get(&mapping.chunk_id)
                    .cloned()
                    .ok_or_else(|| EngineError::NotFound(format!("chunk {}", mapping.chunk_id)))?;
                Ok((mapping, chunk))
            })
            .collect()
    }
}
