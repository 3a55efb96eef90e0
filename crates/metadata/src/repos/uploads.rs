//! Upload session repository.

use crate::error::MetadataResult;
use crate::models::{SessionState, UploadPartRow, UploadSessionRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for resumable upload sessions and their parts.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Create a new upload session.
    async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()>;

    /// Get an upload session by ID.
    async fn get_session(&self, session_id: Uuid) -> MetadataResult<Option<UploadSessionRow>>;

    /// All sessions, newest first.
    async fn list_sessions(&self) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Received parts of a session ordered by index.
    async fn list_parts(&self, session_id: Uuid) -> MetadataResult<Vec<UploadPartRow>>;

    /// Record a received part, replacing any earlier part with the same index.
    ///
    /// Fails with `NotFound` if the session is gone and `Constraint` if it is
    /// no longer active or has expired at `part.received_at`. Returns the
    /// replaced part, whose chunk reference the caller now owns.
    async fn record_part(&self, part: &UploadPartRow) -> MetadataResult<Option<UploadPartRow>>;

    /// Atomically move an active session to `completing`.
    ///
    /// Returns `None` if the session doesn't exist.
    async fn begin_complete_session(
        &self,
        session_id: Uuid,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<Option<CompletionClaim>>;

    /// Update session state.
    async fn update_session_state(
        &self,
        session_id: Uuid,
        state: SessionState,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Mark a session completed with the file and content it committed, and
    /// remove its parts in the same transaction.
    ///
    /// Returns the removed parts; their chunk references pass to the caller.
    async fn finish_session(
        &self,
        session_id: Uuid,
        file_id: Uuid,
        content_hash: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<Vec<UploadPartRow>>;

    /// Sessions whose `expires_at` is before `now`, in any state.
    async fn list_expired_sessions(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Delete a session and its parts.
    ///
    /// Returns the removed parts; their chunk references pass to the caller.
    async fn delete_session(&self, session_id: Uuid) -> MetadataResult<Vec<UploadPartRow>>;
}

/// Outcome of trying to claim a session for completion.
#[derive(Debug, Clone)]
pub enum CompletionClaim {
    /// This caller moved the session from `active` to `completing`.
    Claimed(UploadSessionRow),
    /// The session was not active; it is returned unchanged.
    Unavailable(UploadSessionRow),
}
