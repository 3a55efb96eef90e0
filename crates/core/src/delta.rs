//! Differential sync payloads.
//!
//! A client fetches the [`SignatureSet`] of the current server version,
//! splits its new content the same way and sends only the chunks the server
//! does not already hold, together with the full ordered hash list.

use crate::chunk::{self, ChunkHash, ChunkSignature};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Signatures of one file version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureSet {
    pub file_id: Uuid,
    /// Version the signatures were taken from.
    pub version: i64,
    pub chunk_size: u64,
    pub total_size: u64,
    pub signatures: Vec<ChunkSignature>,
}

impl SignatureSet {
    /// Distinct chunk hashes held by this version.
    pub fn hashes(&self) -> HashSet<ChunkHash> {
        self.signatures.iter().map(|s| s.hash).collect()
    }
}

/// A delta upload: the complete ordered hash list plus the bytes of every
/// chunk the server cannot reuse.
#[derive(Clone, Debug, Default)]
pub struct DeltaRequest {
    /// Version the delta was computed against; a mismatch is a conflict.
    pub base_version: Option<i64>,
    /// Hash of every chunk of the new content, keyed by index.
    pub chunk_hashes: BTreeMap<u32, ChunkHash>,
    /// Bytes of the chunks that changed, keyed by index.
    pub chunks: BTreeMap<u32, Bytes>,
}

impl DeltaRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_version(mut self, version: i64) -> Self {
        self.base_version = Some(version);
        self
    }

    /// Number of chunks in the new content.
    ///
    /// Fails if the hash list is empty, has a gap below its highest index, or
    /// if chunk bytes are supplied for an index outside the hash list.
    pub fn chunk_count(&self) -> crate::Result<u32> {
        let Some((&max_index, _)) = self.chunk_hashes.last_key_value() else {
            return Err(crate::Error::InvalidDelta(
                "chunk hash list is empty".to_string(),
            ));
        };
        let count = max_index
            .checked_add(1)
            .ok_or_else(|| crate::Error::InvalidDelta("chunk index overflow".to_string()))?;
        if self.chunk_hashes.len() as u64 != u64::from(count) {
            let missing = (0..count)
                .find(|i| !self.chunk_hashes.contains_key(i))
                .unwrap_or_default();
            return Err(crate::Error::InvalidDelta(format!(
                "missing hash for chunk index {missing}"
            )));
        }
        if let Some(extra) = self.chunks.keys().find(|i| **i >= count) {
            return Err(crate::Error::InvalidDelta(format!(
                "chunk data supplied for index {extra} beyond chunk count {count}"
            )));
        }
        Ok(count)
    }

    /// Bytes carried by this request.
    pub fn transferred_bytes(&self) -> u64 {
        self.chunks.values().map(|c| c.len() as u64).sum()
    }
}

/// Client-side result of diffing new content against a signature set.
#[derive(Clone, Debug)]
pub struct DeltaPlan {
    pub request: DeltaRequest,
    /// Indices of new-content chunks the server already holds.
    pub matched: Vec<u32>,
}

/// Hashes of data split the way the server splits it.
pub fn chunk_hashes(data: &[u8], chunk_size: u64) -> Vec<ChunkHash> {
    chunk::signatures(data, chunk_size)
        .into_iter()
        .map(|s| s.hash)
        .collect()
}

/// Indices of chunks in `new_data` whose hash appears anywhere in `signatures`.
pub fn find_matching_blocks(
    new_data: &[u8],
    signatures: &[ChunkSignature],
    chunk_size: u64,
) -> Vec<u32> {
    let known: HashSet<ChunkHash> = signatures.iter().map(|s| s.hash).collect();
    chunk::signatures(new_data, chunk_size)
        .into_iter()
        .filter(|s| known.contains(&s.hash))
        .map(|s| s.index)
        .collect()
}

/// Build the delta that turns the `base` version into `new_data`.
pub fn plan_delta(new_data: &Bytes, base: &SignatureSet) -> DeltaPlan {
    let known = base.hashes();
    let mut request = DeltaRequest::new().with_base_version(base.version);
    let mut matched = Vec::new();

    for (index, piece) in chunk::split(new_data, base.chunk_size).into_iter().enumerate() {
        let index = index as u32;
        request.chunk_hashes.insert(index, piece.hash);
        if known.contains(&piece.hash) {
            matched.push(index);
        } else {
            request.chunks.insert(index, piece.data);
        }
    }

    DeltaPlan { request, matched }
}
