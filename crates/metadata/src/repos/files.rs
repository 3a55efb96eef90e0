//! File and directory repository.

use crate::error::MetadataResult;
use crate::models::FileRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for file metadata. Content changes go through
/// [`VersionRepo::commit_version`](crate::repos::VersionRepo::commit_version).
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Create a directory entry. `AlreadyExists` if the path is taken.
    async fn create_directory(&self, dir: &FileRow) -> MetadataResult<()>;

    /// Get a file by id.
    async fn get_file(&self, file_id: Uuid) -> MetadataResult<Option<FileRow>>;

    /// Get the entry with this name in a directory.
    async fn get_file_by_path(&self, path: &str, name: &str) -> MetadataResult<Option<FileRow>>;

    /// Entries directly inside a directory, directories first, then by name.
    async fn list_directory(&self, path: &str) -> MetadataResult<Vec<FileRow>>;

    /// Delete a file and its version history in one transaction.
    ///
    /// Returns the versions that still have mapping sets; the caller retires
    /// them afterwards.
    async fn delete_file(&self, file_id: Uuid) -> MetadataResult<Vec<i64>>;
}
