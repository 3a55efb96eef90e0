//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Storage marker recorded on versions whose content lives in chunk mappings.
pub const STORAGE_MARKER_CHUNKED: &str = "chunked";

// =============================================================================
// Chunks
// =============================================================================

/// Deduplicated chunk record. One row per distinct content hash.
#[derive(Debug, Clone, FromRow)]
pub struct ChunkRow {
    pub chunk_id: Uuid,
    /// Hex SHA-256 of the uncompressed chunk. Unique.
    pub content_hash: String,
    /// Key returned by the blob store.
    pub storage_key: String,
    /// Uncompressed size.
    pub size_bytes: i64,
    /// Size of the stored blob.
    pub stored_bytes: i64,
    pub compressed: bool,
    /// Number of mapping rows (plus in-flight acquisitions) referencing this chunk.
    pub refcount: i64,
    pub state: String,
    pub created_at: OffsetDateTime,
    /// Last time the refcount was raised. Grace periods are measured from here.
    pub last_referenced_at: OffsetDateTime,
}

impl ChunkRow {
    pub fn chunk_state(&self) -> Option<ChunkState> {
        ChunkState::parse(&self.state)
    }
}

/// Chunk lifecycle state.
///
/// A chunk is `Pending` from its first write until a version that maps it is
/// committed; the reaper may reclaim pending chunks nothing maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    Committed,
}

impl ChunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "committed" => Some(Self::Committed),
            _ => None,
        }
    }
}

// =============================================================================
// Chunk mappings
// =============================================================================

/// Position of one chunk within one file version.
#[derive(Debug, Clone, FromRow)]
pub struct ChunkMappingRow {
    pub file_id: Uuid,
    pub version_number: i64,
    pub sequence_number: i64,
    pub chunk_id: Uuid,
    pub offset_in_file: i64,
    pub size_bytes: i64,
    pub created_at: OffsetDateTime,
}

/// Identifies the mapping set of one file version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRow)]
pub struct MappingSetRef {
    pub file_id: Uuid,
    pub version_number: i64,
}

// =============================================================================
// Versions and files
// =============================================================================

/// Immutable history record of one file version.
#[derive(Debug, Clone, FromRow)]
pub struct FileVersionRow {
    pub file_id: Uuid,
    pub version_number: i64,
    pub storage_marker: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub chunk_count: i64,
    pub created_at: OffsetDateTime,
}

/// Current state of a file or directory.
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub file_id: Uuid,
    /// Normalized parent directory.
    pub path: String,
    pub name: String,
    pub is_directory: bool,
    /// Zero for directories, otherwise the latest committed version.
    pub current_version: i64,
    pub size_bytes: i64,
    pub content_hash: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl FileRow {
    /// Full path of this entry.
    pub fn full_path(&self) -> String {
        cirrus_core::path::join(&self.path, &self.name)
    }
}

// =============================================================================
// Resumable upload sessions
// =============================================================================

/// A resumable upload in progress (or finished).
///
/// The payload arrives as numbered parts of `chunk_size` bytes, the last one
/// shorter. Each received part is stored as a chunk the session holds one
/// reference on until it completes or expires.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub session_id: Uuid,
    /// File the upload updates, when it targets an existing file.
    pub target_file_id: Option<Uuid>,
    pub path: String,
    pub name: String,
    pub expected_version: Option<i64>,
    pub size_bytes: i64,
    pub chunk_size: i64,
    pub total_parts: i64,
    pub state: String,
    /// File and content committed by a completed session.
    pub file_id: Option<Uuid>,
    pub content_hash: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl UploadSessionRow {
    pub fn session_state(&self) -> Option<SessionState> {
        SessionState::parse(&self.state)
    }

    /// Exact size part `index` must have, or `None` if the index is out of range.
    pub fn part_size(&self, index: i64) -> Option<i64> {
        if index < 0 || index >= self.total_parts {
            return None;
        }
        if index == self.total_parts - 1 {
            Some(self.size_bytes - self.chunk_size * (self.total_parts - 1))
        } else {
            Some(self.chunk_size)
        }
    }
}

/// Upload session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting parts.
    Active,
    /// One caller is committing the parts as a file version.
    Completing,
    Completed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completing => "completing",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completing" => Some(Self::Completing),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// One received part of an upload session.
#[derive(Debug, Clone, FromRow)]
pub struct UploadPartRow {
    pub session_id: Uuid,
    pub part_index: i64,
    pub chunk_id: Uuid,
    pub size_bytes: i64,
    pub received_at: OffsetDateTime,
}
