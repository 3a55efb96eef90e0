pub mod fixtures;
pub mod metadata;

#[allow(unused_imports)]
pub use metadata::TestMetadata;
