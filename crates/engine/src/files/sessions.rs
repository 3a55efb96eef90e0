//! Resumable uploads.
//!
//! A session fixes the target, total size and part layout up front. Parts
//! are stored as chunks the moment they arrive, in any order and any number
//! of times; completion links them into a new version without copying.

use super::{FileService, UploadTarget};
use crate::chunk_store::ChunkStore;
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use bytes::Bytes;
use cirrus_core::ContentHash;
use cirrus_metadata::models::{FileRow, SessionState, UploadPartRow, UploadSessionRow};
use cirrus_metadata::repos::CompletionClaim;
use cirrus_metadata::{MetadataError, MetadataStore};
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

/// State of a resumable upload as seen by the client.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub session_id: Uuid,
    pub path: String,
    pub name: String,
    /// Existing file the upload writes a new version of.
    pub target_file_id: Option<Uuid>,
    pub size_bytes: u64,
    /// Size of every part but the last.
    pub chunk_size: u64,
    pub total_parts: u32,
    /// Indexes received so far, ascending.
    pub received_parts: Vec<u32>,
    pub state: SessionState,
    /// File committed by a completed session.
    pub file_id: Option<Uuid>,
    pub expires_at: OffsetDateTime,
}

impl UploadSession {
    fn from_rows(row: UploadSessionRow, parts: &[UploadPartRow]) -> EngineResult<Self> {
        let state = row.session_state().ok_or_else(|| {
            EngineError::Internal(format!(
                "upload session {} has unknown state {}",
                row.session_id, row.state
            ))
        })?;
        Ok(Self {
            session_id: row.session_id,
            path: row.path,
            name: row.name,
            target_file_id: row.target_file_id,
            size_bytes: row.size_bytes as u64,
            chunk_size: row.chunk_size as u64,
            total_parts: row.total_parts as u32,
            received_parts: parts.iter().map(|p| p.part_index as u32).collect(),
            state,
            file_id: row.file_id,
            expires_at: row.expires_at,
        })
    }

    /// Indexes still to be sent, ascending.
    pub fn missing_parts(&self) -> Vec<u32> {
        let mut received = self.received_parts.iter().peekable();
        (0..self.total_parts)
            .filter(|index| {
                if received.peek() == Some(&index) {
                    received.next();
                    false
                } else {
                    true
                }
            })
            .collect()
    }

    /// Every part has arrived.
    pub fn is_ready(&self) -> bool {
        self.received_parts.len() == self.total_parts as usize
    }
}

/// Counters from expiring upload sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiredSessions {
    pub sessions: u64,
    pub chunks_purged: u64,
    pub bytes_reclaimed: u64,
}

impl FileService {
    /// Open a resumable upload of `size_bytes` bytes.
    ///
    /// The target and expected version are checked now and again at
    /// completion.
    #[instrument(skip(self))]
    pub async fn init_resumable_upload(
        &self,
        target: UploadTarget,
        size_bytes: u64,
        expected_version: Option<i64>,
    ) -> EngineResult<UploadSession> {
        if size_bytes == 0 {
            return Err(EngineError::Validation("file content is empty".to_string()));
        }
        let size = i64::try_from(size_bytes)
            .map_err(|_| EngineError::Validation(format!("upload of {size_bytes} bytes is too large")))?;

        let write_target = self.resolve_target(&target, expected_version).await?;
        let chunk_size = self.chunks.chunk_size();
        let now = OffsetDateTime::now_utc();
        let row = UploadSessionRow {
            session_id: Uuid::new_v4(),
            target_file_id: write_target.base_version.map(|_| write_target.file_id),
            path: write_target.path,
            name: write_target.name,
            expected_version,
            size_bytes: size,
            chunk_size: chunk_size as i64,
            total_parts: size_bytes.div_ceil(chunk_size) as i64,
            state: SessionState::Active.as_str().to_string(),
            file_id: None,
            content_hash: None,
            created_at: now,
            updated_at: now,
            expires_at: now + self.session_ttl,
        };
        self.metadata.create_session(&row).await?;

        tracing::info!(
            session_id = %row.session_id,
            path = %row.path,
            name = %row.name,
            size = size_bytes,
            parts = row.total_parts,
            "Opened upload session"
        );
        UploadSession::from_rows(row, &[])
    }

    /// Receive part `index` of a session. Sending an index again replaces
    /// the earlier part.
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn upload_chunk(
        &self,
        session_id: Uuid,
        index: u32,
        data: Bytes,
    ) -> EngineResult<UploadSession> {
        let session = self.load_session(session_id).await?;
        ensure_accepting(&session, OffsetDateTime::now_utc())?;

        let expected_size = session.part_size(i64::from(index)).ok_or_else(|| {
            EngineError::Validation(format!(
                "part {index} is out of range for {} parts",
                session.total_parts
            ))
        })?;
        if data.len() as i64 != expected_size {
            return Err(EngineError::Validation(format!(
                "part {index} must be {expected_size} bytes, got {}",
                data.len()
            )));
        }

        let chunk = self
            .chunks
            .store_part(data, self.writer.compress())
            .await?;
        let part = UploadPartRow {
            session_id,
            part_index: i64::from(index),
            chunk_id: chunk.chunk_id,
            size_bytes: expected_size,
            received_at: OffsetDateTime::now_utc(),
        };
        match self.metadata.record_part(&part).await {
            Ok(Some(replaced)) => {
                self.chunks.release(&[replaced.chunk_id]).await;
            }
            Ok(None) => {}
            Err(e) => {
                self.chunks.release(&[chunk.chunk_id]).await;
                return Err(session_error(e));
            }
        }
        metrics::UPLOAD_PARTS_RECEIVED.inc();
        tracing::debug!(session_id = %session_id, index, chunk_id = %chunk.chunk_id, "Received upload part");

        self.get_session(session_id).await
    }

    /// Commit a session whose parts have all arrived as the next version of
    /// its target.
    ///
    /// A failed completion leaves the session active with its parts, so the
    /// client can fix what is missing and try again.
    #[instrument(skip(self))]
    pub async fn complete_resumable_upload(&self, session_id: Uuid) -> EngineResult<FileRow> {
        let claim = self
            .metadata
            .begin_complete_session(session_id, OffsetDateTime::now_utc())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("upload session {session_id}")))?;
        let session = match claim {
            CompletionClaim::Claimed(session) => session,
            CompletionClaim::Unavailable(session) => {
                return Err(EngineError::Validation(format!(
                    "upload session {session_id} is {}",
                    session.state
                )));
            }
        };

        let (file, content_hash) = match self.commit_parts(&session).await {
            Ok(committed) => committed,
            Err(e) => {
                if let Err(revert) = self
                    .metadata
                    .update_session_state(session_id, SessionState::Active, OffsetDateTime::now_utc())
                    .await
                {
                    tracing::warn!(session_id = %session_id, error = %revert, "Failed to reopen upload session");
                }
                return Err(e);
            }
        };

        // The version is committed; from here on the session only gives up its parts
        match self
            .metadata
            .finish_session(
                session_id,
                file.file_id,
                &content_hash.to_hex(),
                OffsetDateTime::now_utc(),
            )
            .await
        {
            Ok(parts) => {
                let ids: Vec<Uuid> = parts.iter().map(|p| p.chunk_id).collect();
                self.chunks.release(&ids).await;
            }
            Err(e) => tracing::warn!(
                session_id = %session_id,
                error = %e,
                "Failed to close completed upload session; its parts are released when it expires"
            ),
        }

        metrics::UPLOAD_SESSIONS_COMPLETED.inc();
        tracing::info!(
            session_id = %session_id,
            file_id = %file.file_id,
            version = file.current_version,
            "Completed upload session"
        );
        Ok(file)
    }

    pub async fn get_session(&self, session_id: Uuid) -> EngineResult<UploadSession> {
        let row = self.load_session(session_id).await?;
        let parts = self.metadata.list_parts(session_id).await?;
        UploadSession::from_rows(row, &parts)
    }

    /// Every session not yet removed, newest first.
    pub async fn list_sessions(&self) -> EngineResult<Vec<UploadSession>> {
        let rows = self.metadata.list_sessions().await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let parts = self.metadata.list_parts(row.session_id).await?;
            sessions.push(UploadSession::from_rows(row, &parts)?);
        }
        Ok(sessions)
    }

    /// Remove sessions past their expiry, releasing the parts they hold.
    pub async fn clean_expired_sessions(&self) -> EngineResult<ExpiredSessions> {
        expire_sessions(
            self.metadata.as_ref(),
            &self.chunks,
            OffsetDateTime::now_utc(),
            EXPIRY_BATCH,
        )
        .await
    }

    async fn load_session(&self, session_id: Uuid) -> EngineResult<UploadSessionRow> {
        self.metadata
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("upload session {session_id}")))
    }

    async fn commit_parts(&self, session: &UploadSessionRow) -> EngineResult<(FileRow, ContentHash)> {
        if session.expires_at <= OffsetDateTime::now_utc() {
            return Err(EngineError::Validation(format!(
                "upload session {} has expired",
                session.session_id
            )));
        }

        let parts = self.metadata.list_parts(session.session_id).await?;
        if parts.len() as i64 != session.total_parts {
            return Err(EngineError::Validation(format!(
                "upload session {} has {} of {} parts",
                session.session_id,
                parts.len(),
                session.total_parts
            )));
        }

        let content_hash = self.hash_parts(&parts).await?;
        let target = match session.target_file_id {
            Some(file_id) => UploadTarget::Existing(file_id),
            None => UploadTarget::new(&session.path, &session.name),
        };
        let write_target = self.resolve_target(&target, session.expected_version).await?;
        let file = self
            .writer
            .link_parts(&write_target, &parts, content_hash)
            .await?;
        Ok((file, content_hash))
    }

    /// Whole-file hash of the parts, read back one chunk at a time.
    async fn hash_parts(&self, parts: &[UploadPartRow]) -> EngineResult<ContentHash> {
        let ids: Vec<Uuid> = parts.iter().map(|p| p.chunk_id).collect();
        let rows = self.metadata.get_chunks_batch(&ids).await?;

        let mut hasher = ContentHash::hasher();
        for part in parts {
            let chunk = rows.get(&part.chunk_id).ok_or_else(|| {
                EngineError::Internal(format!(
                    "chunk {} of upload part {} is missing",
                    part.chunk_id, part.part_index
                ))
            })?;
            hasher.update(&self.assembler.read_chunk(chunk).await?);
        }
        Ok(hasher.finalize())
    }
}

const EXPIRY_BATCH: u32 = 100;

/// Delete sessions that expired before `now`, in any state, releasing the
/// references their parts hold.
pub(crate) async fn expire_sessions(
    metadata: &dyn MetadataStore,
    chunks: &ChunkStore,
    now: OffsetDateTime,
    batch_size: u32,
) -> EngineResult<ExpiredSessions> {
    let mut outcome = ExpiredSessions::default();
    loop {
        let expired = metadata.list_expired_sessions(now, batch_size).await?;
        for session in &expired {
            let parts = metadata.delete_session(session.session_id).await?;
            let ids: Vec<Uuid> = parts.iter().map(|p| p.chunk_id).collect();
            let released = chunks.release(&ids).await;

            outcome.sessions += 1;
            outcome.chunks_purged += released.chunks_purged as u64;
            outcome.bytes_reclaimed += released.bytes_reclaimed;
            tracing::debug!(
                session_id = %session.session_id,
                parts = parts.len(),
                "Expired upload session"
            );
        }
        metrics::UPLOAD_SESSIONS_EXPIRED.inc_by(expired.len() as u64);

        if expired.len() < batch_size as usize {
            return Ok(outcome);
        }
    }
}

fn ensure_accepting(session: &UploadSessionRow, now: OffsetDateTime) -> EngineResult<()> {
    if session.session_state() != Some(SessionState::Active) {
        return Err(EngineError::Validation(format!(
            "upload session {} is {}",
            session.session_id, session.state
        )));
    }
    if session.expires_at <= now {
        return Err(EngineError::Validation(format!(
            "upload session {} has expired",
            session.session_id
        )));
    }
    Ok(())
}

/// A part refused by the store because the session moved on is the
/// client's problem, not a storage failure.
fn session_error(e: MetadataError) -> EngineError {
    match e {
        MetadataError::Constraint(reason) => EngineError::Validation(reason),
        other => other.into(),
    }
}
