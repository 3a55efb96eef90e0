//! Row builders shared by metadata tests.

use cirrus_core::ContentHash;
use cirrus_metadata::models::{
    ChunkMappingRow, ChunkRow, ChunkState, SessionState, UploadPartRow, UploadSessionRow,
};
use cirrus_metadata::repos::VersionCommit;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Hex content hash derived from a seed string.
#[allow(dead_code)]
pub fn test_hash(seed: &str) -> String {
    ContentHash::compute(seed.as_bytes()).to_hex()
}

/// A fresh pending chunk row holding one reference.
#[allow(dead_code)]
pub fn chunk_row(seed: &str, size: i64) -> ChunkRow {
    let now = OffsetDateTime::now_utc();
    let chunk_id = Uuid::new_v4();
    let hash = test_hash(seed);
    ChunkRow {
        chunk_id,
        storage_key: format!("chunks/{}/{}-{}", &hash[..2], hash, chunk_id.simple()),
        content_hash: hash,
        size_bytes: size,
        stored_bytes: size,
        compressed: false,
        refcount: 1,
        state: ChunkState::Pending.as_str().to_string(),
        created_at: now,
        last_referenced_at: now,
    }
}

/// Contiguous mapping set over the given chunks.
#[allow(dead_code)]
pub fn mapping_set(file_id: Uuid, version: i64, chunks: &[&ChunkRow]) -> Vec<ChunkMappingRow> {
    let now = OffsetDateTime::now_utc();
    let mut offset = 0;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let row = ChunkMappingRow {
                file_id,
                version_number: version,
                sequence_number: i as i64,
                chunk_id: chunk.chunk_id,
                offset_in_file: offset,
                size_bytes: chunk.size_bytes,
                created_at: now,
            };
            offset += chunk.size_bytes;
            row
        })
        .collect()
}

/// Commit record matching a mapping set built by [`mapping_set`].
#[allow(dead_code)]
pub fn version_commit(
    file_id: Uuid,
    name: &str,
    version: i64,
    expected_current: Option<i64>,
    chunks: &[&ChunkRow],
) -> VersionCommit {
    VersionCommit {
        file_id,
        path: "/docs".to_string(),
        name: name.to_string(),
        version_number: version,
        expected_current,
        size_bytes: chunks.iter().map(|c| c.size_bytes).sum(),
        content_hash: test_hash(&format!("{file_id}-{version}")),
        chunk_count: chunks.len() as i64,
        committed_at: OffsetDateTime::now_utc(),
    }
}

/// An active upload session for `size` bytes in parts of `chunk_size`.
#[allow(dead_code)]
pub fn upload_session(size: i64, chunk_size: i64, expires_in: Duration) -> UploadSessionRow {
    let now = OffsetDateTime::now_utc();
    UploadSessionRow {
        session_id: Uuid::new_v4(),
        target_file_id: None,
        path: "/uploads".to_string(),
        name: "large.bin".to_string(),
        expected_version: None,
        size_bytes: size,
        chunk_size,
        total_parts: (size + chunk_size - 1) / chunk_size,
        state: SessionState::Active.as_str().to_string(),
        file_id: None,
        content_hash: None,
        created_at: now,
        updated_at: now,
        expires_at: now + expires_in,
    }
}

/// A part of `session` stored in `chunk`.
#[allow(dead_code)]
pub fn upload_part(session: &UploadSessionRow, index: i64, chunk: &ChunkRow) -> UploadPartRow {
    UploadPartRow {
        session_id: session.session_id,
        part_index: index,
        chunk_id: chunk.chunk_id,
        size_bytes: chunk.size_bytes,
        received_at: OffsetDateTime::now_utc(),
    }
}
