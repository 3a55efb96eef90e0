//! Version history and restore.

use crate::assembler::{ByteStream, FileAssembler};
use crate::error::{EngineError, EngineResult};
use crate::events::ChangeEvent;
use crate::writer::{VersionWriter, WriteTarget, ensure_regular_file, load_file};
use bytes::Bytes;
use cirrus_metadata::MetadataStore;
use cirrus_metadata::models::{FileRow, FileVersionRow};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Append-only version history of files.
///
/// Every committed write already records its version, so the history is
/// complete without any extra snapshot step. Restore never rewinds the
/// version counter: it commits the old content as a new version.
pub struct VersionManager {
    metadata: Arc<dyn MetadataStore>,
    assembler: FileAssembler,
    writer: VersionWriter,
}

impl VersionManager {
    pub(crate) fn new(
        metadata: Arc<dyn MetadataStore>,
        assembler: FileAssembler,
        writer: VersionWriter,
    ) -> Self {
        Self {
            metadata,
            assembler,
            writer,
        }
    }

    /// All versions of a file, newest first.
    #[instrument(skip(self))]
    pub async fn history(&self, file_id: Uuid) -> EngineResult<Vec<FileVersionRow>> {
        let file = load_file(self.metadata.as_ref(), file_id).await?;
        ensure_regular_file(&file)?;
        Ok(self.metadata.list_versions(file_id).await?)
    }

    /// One version record.
    pub async fn get_version(&self, file_id: Uuid, version: i64) -> EngineResult<FileVersionRow> {
        self.metadata
            .get_version(file_id, version)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("file {file_id} version {version}")))
    }

    /// Content of a historical version.
    ///
    /// Works after the file has moved on, as long as the version's mapping
    /// set is retained.
    #[instrument(skip(self))]
    pub async fn download_version(&self, file_id: Uuid, version: i64) -> EngineResult<Bytes> {
        self.get_version(file_id, version).await?;
        self.assembler.assemble(file_id, version).await
    }

    /// Streaming variant of [`VersionManager::download_version`].
    pub async fn stream_version(&self, file_id: Uuid, version: i64) -> EngineResult<ByteStream> {
        self.get_version(file_id, version).await?;
        self.assembler.stream(file_id, version).await
    }

    /// Commit the content of `target_version` as the file's next version.
    #[instrument(skip(self))]
    pub async fn restore(
        &self,
        file_id: Uuid,
        target_version: i64,
        expected_version: Option<i64>,
    ) -> EngineResult<FileRow> {
        let file = load_file(self.metadata.as_ref(), file_id).await?;
        ensure_regular_file(&file)?;
        self.writer.check_expected(&file, expected_version)?;

        let source = self.get_version(file_id, target_version).await?;
        let restored = self
            .writer
            .link(&WriteTarget::next_version_of(&file), &source)
            .await?;

        self.writer.events().publish(ChangeEvent::Restored {
            file_id,
            from_version: target_version,
            version: restored.current_version,
        });
        tracing::info!(
            file_id = %file_id,
            restored_from = target_version,
            version = restored.current_version,
            "Restored file version"
        );
        Ok(restored)
    }
}
