//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Chunking and compression settings for the storage engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fixed chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Compression applied to newly stored chunks.
    #[serde(default)]
    pub compression: CompressionConfig,
    /// How long a resumable upload session accepts parts.
    #[serde(default = "default_upload_session_ttl")]
    pub upload_session_ttl_secs: u64,
    /// Change events buffered per subscriber before the slowest one lags.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_chunk_size() -> u64 {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_upload_session_ttl() -> u64 {
    24 * 60 * 60
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            compression: CompressionConfig::default(),
            upload_session_ttl_secs: default_upload_session_ttl(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with the given chunk size and default compression.
    pub fn with_chunk_size(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            ..Self::default()
        }
    }

    /// Whether new chunks should be offered to the compressor.
    pub fn compress(&self) -> bool {
        self.compression != CompressionConfig::None
    }

    pub fn upload_session_ttl(&self) -> Duration {
        Duration::seconds(self.upload_session_ttl_secs as i64)
    }

    pub fn validate(&self) -> Result<(), String> {
        crate::chunk::validate_chunk_size(self.chunk_size)
            .map_err(|e| format!("engine.chunk_size: {e}"))?;
        if self.upload_session_ttl_secs == 0 {
            return Err("engine.upload_session_ttl_secs must be greater than 0".to_string());
        }
        if self.event_capacity == 0 {
            return Err("engine.event_capacity must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Chunk compression.
///
/// A compressed copy is only kept when it is smaller than the raw chunk.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionConfig {
    None,
    #[default]
    Gzip,
}

/// Blob storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for blobs.
        path: PathBuf,
    },
    /// Process-local storage, lost on exit. Intended for tests and demos.
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/blobs"),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } if path.as_os_str().is_empty() => {
                Err("storage.path cannot be empty".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// How long a writer waits on a locked database, in seconds.
        #[serde(default = "default_busy_timeout_secs")]
        busy_timeout_secs: u64,
    },
}

fn default_busy_timeout_secs() -> u64 {
    5
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { path, .. } if path.as_os_str().is_empty() => {
                Err("metadata.path cannot be empty".to_string())
            }
            MetadataConfig::Sqlite { .. } => Ok(()),
        }
    }
}

/// Garbage collection configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Minimum age in seconds before an orphaned mapping set or an unreferenced
    /// chunk may be reclaimed. In-flight uploads younger than this are safe.
    #[serde(default = "default_gc_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Maximum number of items examined per sweep phase.
    #[serde(default = "default_gc_batch_size")]
    pub batch_size: u32,
    /// Run sweeps on a schedule.
    #[serde(default)]
    pub auto_schedule_enabled: bool,
    /// Interval in seconds between scheduled sweeps.
    #[serde(default = "default_gc_auto_schedule_interval_secs")]
    pub auto_schedule_interval_secs: u64,
    /// Report what would be reclaimed without deleting anything.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_gc_grace_period_secs() -> u64 {
    3600
}

fn default_gc_batch_size() -> u32 {
    1000
}

fn default_gc_auto_schedule_interval_secs() -> u64 {
    3600
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_gc_grace_period_secs(),
            batch_size: default_gc_batch_size(),
            auto_schedule_enabled: false,
            auto_schedule_interval_secs: default_gc_auto_schedule_interval_secs(),
            dry_run: false,
        }
    }
}

impl GcConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::seconds(i64::try_from(self.grace_period_secs).unwrap_or(i64::MAX))
    }

    pub fn auto_schedule_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.auto_schedule_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.grace_period_secs > i64::MAX as u64 {
            return Err(format!(
                "gc.grace_period_secs {} exceeds maximum value {}",
                self.grace_period_secs,
                i64::MAX
            ));
        }
        if self.batch_size == 0 {
            return Err("gc.batch_size cannot be 0".to_string());
        }
        // A zero interval would sweep back to back
        if self.auto_schedule_enabled && self.auto_schedule_interval_secs == 0 {
            return Err("gc.auto_schedule_interval_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub gc: GcConfig,
}

impl AppConfig {
    /// Validate every section, reporting the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.engine.validate()?;
        self.storage.validate()?;
        self.metadata.validate()?;
        self.gc.validate()
    }
}
