//! Engine error types.

use cirrus_metadata::MetadataError;
use cirrus_storage::StorageError;
use uuid::Uuid;

/// A failure of one of the engine's storage collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StorageFailure {
    #[error("blob store error: {0}")]
    Blob(StorageError),

    #[error("metadata error: {0}")]
    Metadata(MetadataError),
}

/// Engine error type.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageFailure),

    #[error("version conflict on file {file_id}: expected version {expected}, current is {actual}")]
    VersionConflict {
        file_id: Uuid,
        expected: i64,
        actual: i64,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage_error",
            Self::VersionConflict { .. } => "version_conflict",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => Self::NotFound(format!("blob {key}")),
            other => Self::Storage(StorageFailure::Blob(other)),
        }
    }
}

impl From<MetadataError> for EngineError {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::NotFound(what) => Self::NotFound(what),
            MetadataError::AlreadyExists(what) => Self::Validation(format!("{what} already exists")),
            MetadataError::VersionConflict {
                file_id,
                expected,
                actual,
            } => Self::VersionConflict {
                file_id,
                expected,
                actual,
            },
            other => Self::Storage(StorageFailure::Metadata(other)),
        }
    }
}

impl From<cirrus_core::Error> for EngineError {
    fn from(e: cirrus_core::Error) -> Self {
        Self::Validation(e.to_string())
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
