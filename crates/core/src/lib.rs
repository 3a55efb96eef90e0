//! Core domain types and shared logic for the Cirrus storage engine.
//!
//! This crate defines the data model used across all other crates:
//! - Content and chunk hashes
//! - Fixed-size chunk splitting and chunk signatures
//! - Differential sync requests and client-side delta planning
//! - Conflict strategies
//! - Directory path rules
//! - Configuration

pub mod chunk;
pub mod config;
pub mod conflict;
pub mod delta;
pub mod error;
pub mod hash;
pub mod path;

pub use chunk::{Chunk, ChunkHash, ChunkSignature};
pub use conflict::ConflictStrategy;
pub use delta::{DeltaPlan, DeltaRequest, SignatureSet};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};

/// Default chunk size: 4 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Maximum chunk size: 64 MiB
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Minimum chunk size: 1 KiB
pub const MIN_CHUNK_SIZE: u64 = 1024;
