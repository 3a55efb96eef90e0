//! Metadata store error types.

use thiserror::Error;
use uuid::Uuid;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("version conflict on file {file_id}: expected version {expected}, found {actual}")]
    VersionConflict {
        file_id: Uuid,
        expected: i64,
        actual: i64,
    },

    /// The `(file, version)` slot already holds a mapping set or a committed version.
    #[error("version {version} of file {file_id} is already taken")]
    SlotTaken { file_id: Uuid, version: i64 },

    /// A mapping names a chunk row that no longer exists.
    #[error("chunk {0} does not exist")]
    UnknownChunk(Uuid),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        MetadataError::Config(e.to_string())
    }
}

impl MetadataError {
    /// Whether a database error is a UNIQUE or PRIMARY KEY violation.
    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE constraint"))
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
