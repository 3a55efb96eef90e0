//! File service: upload, download and the directory tree.

mod sessions;

pub(crate) use sessions::expire_sessions;
pub use sessions::{ExpiredSessions, UploadSession};

use crate::assembler::{ByteStream, FileAssembler};
use crate::chunk_store::ChunkStore;
use crate::error::{EngineError, EngineResult};
use crate::events::ChangeEvent;
use crate::writer::{VersionWriter, WriteTarget, ensure_regular_file, load_file};
use bytes::Bytes;
use cirrus_core::{ContentHash, path};
use cirrus_metadata::MetadataStore;
use cirrus_metadata::models::FileRow;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

/// What an upload writes to.
#[derive(Debug, Clone)]
pub enum UploadTarget {
    /// A path; updates the file already there, otherwise creates one.
    New { path: String, name: String },
    /// An existing file.
    Existing(Uuid),
}

impl UploadTarget {
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self::New {
            path: path.into(),
            name: name.into(),
        }
    }
}

/// Outcome of deleting a file or directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    pub mapping_sets_retired: usize,
    pub chunks_purged: usize,
    pub bytes_reclaimed: u64,
}

pub struct FileService {
    metadata: Arc<dyn MetadataStore>,
    chunks: Arc<ChunkStore>,
    assembler: FileAssembler,
    writer: VersionWriter,
    session_ttl: time::Duration,
}

impl FileService {
    pub(crate) fn new(
        metadata: Arc<dyn MetadataStore>,
        chunks: Arc<ChunkStore>,
        assembler: FileAssembler,
        writer: VersionWriter,
        session_ttl: time::Duration,
    ) -> Self {
        Self {
            metadata,
            chunks,
            assembler,
            writer,
            session_ttl,
        }
    }

    /// Store new content for a file, creating it if needed.
    #[instrument(skip(self, content), fields(size = content.len()))]
    pub async fn upload(
        &self,
        target: UploadTarget,
        content: Bytes,
        expected_version: Option<i64>,
    ) -> EngineResult<FileRow> {
        if content.is_empty() {
            return Err(EngineError::Validation("file content is empty".to_string()));
        }

        let write_target = self.resolve_target(&target, expected_version).await?;
        self.writer.write(&write_target, &content).await
    }

    /// Where a write to `target` goes, checking the caller's expected version.
    pub(crate) async fn resolve_target(
        &self,
        target: &UploadTarget,
        expected_version: Option<i64>,
    ) -> EngineResult<WriteTarget> {
        match target {
            UploadTarget::Existing(file_id) => {
                let file = load_file(self.metadata.as_ref(), *file_id).await?;
                ensure_regular_file(&file)?;
                self.writer.check_expected(&file, expected_version)?;
                Ok(WriteTarget::next_version_of(&file))
            }
            UploadTarget::New { path: raw_dir, name } => {
                let dir = path::normalize_dir(raw_dir);
                let name = path::validate_name(name)?;
                match self.metadata.get_file_by_path(&dir, &name).await? {
                    Some(file) => {
                        ensure_regular_file(&file)?;
                        self.writer.check_expected(&file, expected_version)?;
                        Ok(WriteTarget::next_version_of(&file))
                    }
                    None => {
                        if let Some(expected) = expected_version.filter(|v| *v != 0) {
                            return Err(EngineError::NotFound(format!(
                                "{} (expected version {expected})",
                                path::join(&dir, &name)
                            )));
                        }
                        Ok(WriteTarget::new_file(&dir, &name))
                    }
                }
            }
        }
    }

    /// Current content of a file.
    #[instrument(skip(self))]
    pub async fn download(&self, file_id: Uuid) -> EngineResult<Bytes> {
        let file = load_file(self.metadata.as_ref(), file_id).await?;
        ensure_regular_file(&file)?;
        self.assembler.assemble(file_id, file.current_version).await
    }

    /// Streaming variant of [`FileService::download`].
    pub async fn download_stream(&self, file_id: Uuid) -> EngineResult<ByteStream> {
        let file = load_file(self.metadata.as_ref(), file_id).await?;
        ensure_regular_file(&file)?;
        self.assembler.stream(file_id, file.current_version).await
    }

    /// Create a file from content the store already holds, identified by its
    /// whole-file hash. No bytes are transferred.
    #[instrument(skip(self))]
    pub async fn quick_upload(
        &self,
        content_hash: &str,
        path: &str,
        name: &str,
    ) -> EngineResult<FileRow> {
        let hash = ContentHash::from_hex(content_hash)?;
        let dir = path::normalize_dir(path);
        let name = path::validate_name(name)?;

        if self.metadata.get_file_by_path(&dir, &name).await?.is_some() {
            return Err(EngineError::Validation(format!(
                "{} already exists",
                path::join(&dir, &name)
            )));
        }

        let source = self
            .metadata
            .find_version_by_content_hash(&hash.to_hex())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("content {hash}")))?;

        self.writer
            .link(&WriteTarget::new_file(&dir, &name), &source)
            .await
    }

    pub async fn create_directory(&self, path: &str, name: &str) -> EngineResult<FileRow> {
        let now = OffsetDateTime::now_utc();
        let dir = FileRow {
            file_id: Uuid::new_v4(),
            path: path::normalize_dir(path),
            name: path::validate_name(name)?,
            is_directory: true,
            current_version: 0,
            size_bytes: 0,
            content_hash: None,
            created_at: now,
            updated_at: now,
        };
        self.metadata.create_directory(&dir).await?;
        self.writer.events().publish(ChangeEvent::DirectoryCreated {
            file_id: dir.file_id,
            path: dir.full_path(),
        });
        tracing::info!(path = %dir.full_path(), "Created directory");
        Ok(dir)
    }

    /// Entries of a directory, directories first, then by name.
    pub async fn list(&self, path: &str) -> EngineResult<Vec<FileRow>> {
        Ok(self
            .metadata
            .list_directory(&path::normalize_dir(path))
            .await?)
    }

    pub async fn get(&self, file_id: Uuid) -> EngineResult<FileRow> {
        load_file(self.metadata.as_ref(), file_id).await
    }

    /// Delete a file with its whole history, or an empty directory.
    #[instrument(skip(self))]
    pub async fn delete(&self, file_id: Uuid) -> EngineResult<DeleteSummary> {
        let file = load_file(self.metadata.as_ref(), file_id).await?;
        if file.is_directory
            && !self
                .metadata
                .list_directory(&file.full_path())
                .await?
                .is_empty()
        {
            return Err(EngineError::Validation(format!(
                "directory {} is not empty",
                file.full_path()
            )));
        }

        let mapped_versions = self.metadata.delete_file(file_id).await?;
        self.writer.events().publish(ChangeEvent::Deleted {
            file_id,
            path: file.full_path(),
        });

        let mut summary = DeleteSummary::default();
        for version in mapped_versions {
            // Sets left behind have no version record and are swept later
            match self.chunks.delete(file_id, version).await {
                Ok(retired) => {
                    summary.mapping_sets_retired += 1;
                    summary.chunks_purged += retired.chunks_purged;
                    summary.bytes_reclaimed += retired.bytes_reclaimed;
                }
                Err(e) => tracing::warn!(
                    file_id = %file_id,
                    version = version,
                    error = %e,
                    "Failed to retire mapping set of deleted file"
                ),
            }
        }

        tracing::info!(
            file_id = %file_id,
            path = %file.full_path(),
            mapping_sets = summary.mapping_sets_retired,
            purged = summary.chunks_purged,
            "Deleted file"
        );
        Ok(summary)
    }
}
