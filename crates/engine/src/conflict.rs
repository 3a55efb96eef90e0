//! Optimistic-concurrency conflict detection and resolution.
//!
//! A conflict is reported, never resolved implicitly. The caller picks a
//! strategy and the resolver commits exactly one new version: on the
//! original file for overwrite and merge, on a new sibling file for copy.
//! A failed resolution leaves the file at its previous version.

use crate::error::{EngineError, EngineResult};
use crate::writer::{VersionWriter, WriteTarget, ensure_regular_file, load_file};
use bytes::Bytes;
use cirrus_core::conflict::conflict_copy_name;
use cirrus_core::{ConflictStrategy, path};
use cirrus_metadata::MetadataStore;
use cirrus_metadata::models::FileRow;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

/// Result of comparing a client's version with the server's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictCheck {
    pub file_id: Uuid,
    pub expected_version: i64,
    pub current_version: i64,
}

impl ConflictCheck {
    pub fn has_conflict(&self) -> bool {
        self.expected_version != self.current_version
    }
}

/// Content and guards for a resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    pub content: Bytes,
    /// Version the caller last saw. Overwrite requires it unless `force` is set.
    pub expected_version: Option<i64>,
    /// Overwrite without an expected version.
    pub force: bool,
    /// Name for the copy; generated when absent.
    pub copy_name: Option<String>,
}

impl ResolveRequest {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn expecting(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.copy_name = Some(name.into());
        self
    }
}

/// A committed resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub strategy: ConflictStrategy,
    /// The file that received the new version.
    pub file: FileRow,
    /// Version of the original file at resolution time.
    pub previous_version: i64,
}

pub struct ConflictResolver {
    metadata: Arc<dyn MetadataStore>,
    writer: VersionWriter,
}

impl ConflictResolver {
    pub(crate) fn new(metadata: Arc<dyn MetadataStore>, writer: VersionWriter) -> Self {
        Self { metadata, writer }
    }

    /// Compare the caller's version with the file's current version.
    pub async fn check_conflict(
        &self,
        file_id: Uuid,
        expected_version: i64,
    ) -> EngineResult<ConflictCheck> {
        let file = load_file(self.metadata.as_ref(), file_id).await?;
        ensure_regular_file(&file)?;
        Ok(ConflictCheck {
            file_id,
            expected_version,
            current_version: file.current_version,
        })
    }

    /// Resolve with a strategy given by name (`OVERWRITE`, `CREATE_COPY`, `MERGE`).
    pub async fn resolve_named(
        &self,
        file_id: Uuid,
        strategy: &str,
        request: ResolveRequest,
    ) -> EngineResult<Resolution> {
        let strategy: ConflictStrategy = strategy.parse()?;
        self.resolve(file_id, strategy, request).await
    }

    #[instrument(skip(self, request), fields(size = request.content.len()))]
    pub async fn resolve(
        &self,
        file_id: Uuid,
        strategy: ConflictStrategy,
        request: ResolveRequest,
    ) -> EngineResult<Resolution> {
        if request.content.is_empty() {
            return Err(EngineError::Validation(
                "resolution content cannot be empty".to_string(),
            ));
        }

        let file = load_file(self.metadata.as_ref(), file_id).await?;
        ensure_regular_file(&file)?;

        let committed = match strategy {
            ConflictStrategy::Overwrite => {
                if request.expected_version.is_none() && !request.force {
                    return Err(EngineError::Validation(
                        "overwrite requires an expected version or force".to_string(),
                    ));
                }
                self.writer.check_expected(&file, request.expected_version)?;
                self.writer
                    .write(&WriteTarget::next_version_of(&file), &request.content)
                    .await?
            }
            ConflictStrategy::Merge => {
                self.writer.check_expected(&file, request.expected_version)?;
                self.writer
                    .write(&WriteTarget::next_version_of(&file), &request.content)
                    .await?
            }
            ConflictStrategy::CreateCopy => {
                let name = match &request.copy_name {
                    Some(name) => path::validate_name(name)?,
                    None => conflict_copy_name(
                        &file.name,
                        OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000,
                    ),
                };
                self.writer
                    .write(&WriteTarget::new_file(&file.path, &name), &request.content)
                    .await?
            }
        };

        tracing::info!(
            file_id = %file_id,
            strategy = %strategy,
            target_file = %committed.file_id,
            version = committed.current_version,
            "Resolved conflict"
        );

        Ok(Resolution {
            strategy,
            file: committed,
            previous_version: file.current_version,
        })
    }
}
