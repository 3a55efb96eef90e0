//! Chunk types, fixed-size splitting and chunk signatures.

use crate::hash::ContentHash;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A chunk hash (SHA-256 of the uncompressed chunk contents).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkHash(ContentHash);

impl ChunkHash {
    /// Create from a ContentHash.
    pub fn from_content_hash(hash: ContentHash) -> Self {
        Self(hash)
    }

    /// Compute the hash of chunk data.
    pub fn compute(data: &[u8]) -> Self {
        Self(ContentHash::compute(data))
    }

    /// Get the underlying content hash.
    pub fn content_hash(&self) -> &ContentHash {
        &self.0
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        Ok(Self(ContentHash::from_hex(s)?))
    }

    /// Encode as hex string.
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Blob key hint for one stored copy of this chunk.
    ///
    /// Keys fan out over two directory levels and carry the chunk id, so two
    /// rows holding the same content never share a blob.
    pub fn storage_key_hint(&self, chunk_id: Uuid, compressed: bool) -> String {
        let hex = self.to_hex();
        let suffix = if compressed { ".gz" } else { "" };
        format!(
            "chunks/{}/{}/{}-{}{}",
            &hex[..2],
            &hex[2..4],
            hex,
            chunk_id.simple(),
            suffix
        )
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Per-chunk signature of a file version, as exchanged during diff sync.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSignature {
    /// Position in the file (0-indexed).
    pub index: u32,
    pub hash: ChunkHash,
    pub size: u64,
    /// Byte offset of the chunk within the file.
    pub offset: u64,
}

/// A chunk with its data.
#[derive(Clone)]
pub struct Chunk {
    /// The chunk hash (computed from data).
    pub hash: ChunkHash,
    pub data: Bytes,
}

impl Chunk {
    /// Create a new chunk from data, computing the hash.
    pub fn new(data: Bytes) -> Self {
        let hash = ChunkHash::compute(&data);
        Self { hash, data }
    }

    /// Verify that the data matches the expected hash.
    pub fn verify(&self, expected: &ChunkHash) -> crate::Result<()> {
        if &self.hash != expected {
            return Err(crate::Error::HashMismatch {
                expected: expected.to_hex(),
                actual: self.hash.to_hex(),
            });
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("hash", &self.hash)
            .field("size", &self.data.len())
            .finish()
    }
}

/// Check a chunk size against the supported range.
pub fn validate_chunk_size(chunk_size: u64) -> crate::Result<()> {
    if !(crate::MIN_CHUNK_SIZE..=crate::MAX_CHUNK_SIZE).contains(&chunk_size) {
        return Err(crate::Error::InvalidChunkSize {
            size: chunk_size,
            min: crate::MIN_CHUNK_SIZE,
            max: crate::MAX_CHUNK_SIZE,
        });
    }
    Ok(())
}

/// Split data into fixed-size chunks; only the last one may be shorter.
///
/// The returned chunks share the input buffer.
pub fn split(data: &Bytes, chunk_size: u64) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1) as usize;
    (0..data.len())
        .step_by(chunk_size)
        .map(|start| {
            let end = (start + chunk_size).min(data.len());
            Chunk::new(data.slice(start..end))
        })
        .collect()
}

/// Compute the signatures of data as it would be split by [`split`].
pub fn signatures(data: &[u8], chunk_size: u64) -> Vec<ChunkSignature> {
    let chunk_size = chunk_size.max(1) as usize;
    data.chunks(chunk_size)
        .enumerate()
        .map(|(i, piece)| ChunkSignature {
            index: i as u32,
            hash: ChunkHash::compute(piece),
            size: piece.len() as u64,
            offset: (i * chunk_size) as u64,
        })
        .collect()
}
