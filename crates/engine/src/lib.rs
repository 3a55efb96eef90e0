//! Cirrus storage engine.
//!
//! Chunked, content-addressed file storage with deduplication, version
//! history, resumable uploads, differential sync and conflict resolution,
//! with change notifications, on top of a
//! [`BlobStore`](cirrus_storage::BlobStore) for bytes and a
//! [`MetadataStore`](cirrus_metadata::MetadataStore) for bookkeeping.

pub mod assembler;
pub mod chunk_store;
pub mod compression;
pub mod conflict;
pub mod diff_sync;
pub mod engine;
pub mod error;
pub mod events;
pub mod files;
pub mod metrics;
pub mod reaper;
pub mod versions;
mod writer;

pub use assembler::{ByteStream, FileAssembler};
pub use chunk_store::{ChunkStore, RetiredChunks, StoredChunks};
pub use conflict::{ConflictCheck, ConflictResolver, Resolution, ResolveRequest};
pub use diff_sync::DiffSyncEngine;
pub use engine::Engine;
pub use error::{EngineError, EngineResult, StorageFailure};
pub use events::{ChangeEvent, EventHub};
pub use files::{DeleteSummary, ExpiredSessions, FileService, UploadSession, UploadTarget};
pub use reaper::{Reaper, SweepStats};
pub use versions::VersionManager;
