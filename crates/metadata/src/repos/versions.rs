//! File version repository.

use crate::error::MetadataResult;
use crate::models::{FileRow, FileVersionRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for the append-only version history.
#[async_trait]
pub trait VersionRepo: Send + Sync {
    /// Publish a new version and move the file's current pointer to it.
    ///
    /// In one transaction:
    /// - create the file (`expected_current == None`) or compare-and-swap its
    ///   current version from `expected_current` to `version_number`,
    /// - append the version record,
    /// - mark every chunk mapped by the version as committed.
    ///
    /// Fails with `VersionConflict` if the file moved on, `AlreadyExists` if a
    /// new file's path is taken, and `Constraint` if the version's mapping set
    /// is missing.
    async fn commit_version(&self, commit: &VersionCommit) -> MetadataResult<FileRow>;

    /// Get one version record.
    async fn get_version(
        &self,
        file_id: Uuid,
        version_number: i64,
    ) -> MetadataResult<Option<FileVersionRow>>;

    /// All version records of a file, newest first.
    async fn list_versions(&self, file_id: Uuid) -> MetadataResult<Vec<FileVersionRow>>;

    /// Most recent version with this whole-file hash whose mapping set still exists.
    async fn find_version_by_content_hash(
        &self,
        content_hash: &str,
    ) -> MetadataResult<Option<FileVersionRow>>;
}

/// A version about to be published.
#[derive(Debug, Clone)]
pub struct VersionCommit {
    pub file_id: Uuid,
    /// Parent directory and name; only used when creating the file.
    pub path: String,
    pub name: String,
    pub version_number: i64,
    /// Current version the writer started from; `None` creates the file.
    pub expected_current: Option<i64>,
    pub size_bytes: i64,
    pub content_hash: String,
    pub chunk_count: i64,
    pub committed_at: OffsetDateTime,
}
