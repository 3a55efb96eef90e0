//! Repository traits for metadata operations.

pub mod chunks;
pub mod files;
pub mod mappings;
pub mod uploads;
pub mod versions;

pub use chunks::{ChunkRepo, ChunkStats};
pub use files::FileRepo;
pub use mappings::{MappingRepo, RetiredMappingSet};
pub use uploads::{CompletionClaim, UploadRepo};
pub use versions::{VersionCommit, VersionRepo};
