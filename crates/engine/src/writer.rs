//! Version publishing shared by every content-changing operation.
//!
//! A write stores (or links) the new version's mapping set first and then
//! commits the version record and the file's current pointer together. If
//! the commit fails the mapping set is retracted, so a failed write leaves
//! the file and its history exactly as they were.
//!
//! Commits and version conflicts are published on the engine's event hub
//! from here, so every write path reports them the same way.

use crate::chunk_store::{ChunkStore, StoredChunks};
use crate::error::{EngineError, EngineResult};
use crate::events::{ChangeEvent, EventHub};
use crate::metrics;
use bytes::Bytes;
use cirrus_core::ContentHash;
use cirrus_metadata::MetadataStore;
use cirrus_metadata::models::{FileRow, FileVersionRow, UploadPartRow};
use cirrus_metadata::repos::VersionCommit;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// Where a new version goes.
#[derive(Debug, Clone)]
pub(crate) struct WriteTarget {
    pub file_id: Uuid,
    pub path: String,
    pub name: String,
    /// Current version the write is based on; `None` creates the file.
    pub base_version: Option<i64>,
}

impl WriteTarget {
    pub fn new_file(path: &str, name: &str) -> Self {
        Self {
            file_id: Uuid::new_v4(),
            path: path.to_string(),
            name: name.to_string(),
            base_version: None,
        }
    }

    pub fn next_version_of(file: &FileRow) -> Self {
        Self {
            file_id: file.file_id,
            path: file.path.clone(),
            name: file.name.clone(),
            base_version: Some(file.current_version),
        }
    }

    pub fn version_number(&self) -> i64 {
        self.base_version.unwrap_or(0) + 1
    }
}

#[derive(Clone)]
pub(crate) struct VersionWriter {
    chunks: Arc<ChunkStore>,
    metadata: Arc<dyn MetadataStore>,
    events: EventHub,
    compress: bool,
}

impl VersionWriter {
    pub fn new(
        chunks: Arc<ChunkStore>,
        metadata: Arc<dyn MetadataStore>,
        events: EventHub,
        compress: bool,
    ) -> Self {
        Self {
            chunks,
            metadata,
            events,
            compress,
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    /// [`ensure_expected_version`], publishing the conflict if there is one.
    pub fn check_expected(&self, file: &FileRow, expected: Option<i64>) -> EngineResult<()> {
        self.events.conflicts(ensure_expected_version(file, expected))
    }

    /// Store `payload` as the next version of the target.
    pub async fn write(&self, target: &WriteTarget, payload: &Bytes) -> EngineResult<FileRow> {
        let stored = self.events.conflicts(
            self.chunks
                .store(target.file_id, target.version_number(), payload, self.compress)
                .await,
        )?;
        self.publish(target, stored).await
    }

    /// Make the content of an existing version the next version of the target.
    pub async fn link(&self, target: &WriteTarget, source: &FileVersionRow) -> EngineResult<FileRow> {
        let stored = self.events.conflicts(
            self.chunks
                .link(source, target.file_id, target.version_number())
                .await,
        )?;
        self.publish(target, stored).await
    }

    /// Commit received upload parts, in order, as the next version of the target.
    pub async fn link_parts(
        &self,
        target: &WriteTarget,
        parts: &[UploadPartRow],
        content_hash: ContentHash,
    ) -> EngineResult<FileRow> {
        let stored = self.events.conflicts(
            self.chunks
                .link_parts(target.file_id, target.version_number(), parts, content_hash)
                .await,
        )?;
        self.publish(target, stored).await
    }

    async fn publish(&self, target: &WriteTarget, stored: StoredChunks) -> EngineResult<FileRow> {
        let commit = VersionCommit {
            file_id: target.file_id,
            path: target.path.clone(),
            name: target.name.clone(),
            version_number: stored.version,
            expected_current: target.base_version,
            size_bytes: stored.size_bytes as i64,
            content_hash: stored.content_hash.to_hex(),
            chunk_count: stored.chunk_count as i64,
            committed_at: OffsetDateTime::now_utc(),
        };

        match self.metadata.commit_version(&commit).await {
            Ok(file) => {
                metrics::VERSIONS_COMMITTED.inc();
                self.events.publish(ChangeEvent::Committed {
                    file_id: file.file_id,
                    path: file.full_path(),
                    version: file.current_version,
                    size_bytes: file.size_bytes,
                    content_hash: commit.content_hash.clone(),
                });
                tracing::info!(
                    file_id = %file.file_id,
                    path = %file.full_path(),
                    version = file.current_version,
                    size = file.size_bytes,
                    new_chunks = stored.new_chunks,
                    reused_chunks = stored.reused_chunks,
                    "Committed file version"
                );
                Ok(file)
            }
            Err(e) => {
                if let Err(retract) = self.chunks.delete(stored.file_id, stored.version).await {
                    tracing::warn!(
                        file_id = %stored.file_id,
                        version = stored.version,
                        error = %retract,
                        "Failed to retract mapping set of failed commit"
                    );
                }
                let err = EngineError::from(e);
                if err.is_version_conflict() {
                    metrics::VERSION_CONFLICTS.inc();
                }
                self.events.conflicts(Err(err))
            }
        }
    }
}

/// Reject a write based on a version other than the file's current one.
fn ensure_expected_version(file: &FileRow, expected: Option<i64>) -> EngineResult<()> {
    match expected {
        Some(expected) if expected != file.current_version => {
            metrics::VERSION_CONFLICTS.inc();
            Err(EngineError::VersionConflict {
                file_id: file.file_id,
                expected,
                actual: file.current_version,
            })
        }
        _ => Ok(()),
    }
}

/// Reject directories where file content is required.
pub(crate) fn ensure_regular_file(file: &FileRow) -> EngineResult<()> {
    if file.is_directory {
        return Err(EngineError::Validation(format!(
            "{} is a directory",
            file.full_path()
        )));
    }
    Ok(())
}

/// Load a file by id.
pub(crate) async fn load_file(metadata: &dyn MetadataStore, file_id: Uuid) -> EngineResult<FileRow> {
    metadata
        .get_file(file_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("file {file_id}")))
}
