//! Engine wiring.

use crate::assembler::FileAssembler;
use crate::chunk_store::ChunkStore;
use crate::conflict::ConflictResolver;
use crate::diff_sync::DiffSyncEngine;
use crate::error::{EngineError, EngineResult, StorageFailure};
use crate::events::{ChangeEvent, EventHub};
use crate::files::FileService;
use crate::reaper::Reaper;
use crate::versions::VersionManager;
use crate::writer::VersionWriter;
use cirrus_core::config::{AppConfig, EngineConfig, GcConfig};
use cirrus_metadata::MetadataStore;
use cirrus_metadata::repos::ChunkStats;
use cirrus_storage::BlobStore;
use std::sync::Arc;
use tokio::sync::broadcast;

/// The storage engine: every component sharing one blob store and one
/// metadata store.
pub struct Engine {
    storage: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    chunks: Arc<ChunkStore>,
    assembler: FileAssembler,
    files: FileService,
    sync: DiffSyncEngine,
    versions: VersionManager,
    conflicts: ConflictResolver,
    events: EventHub,
}

impl Engine {
    pub fn new(
        storage: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate().map_err(EngineError::Validation)?;

        let chunks = Arc::new(ChunkStore::new(storage.clone(), metadata.clone(), &config));
        let assembler = FileAssembler::new(storage.clone(), metadata.clone());
        let events = EventHub::new(config.event_capacity);
        let writer = VersionWriter::new(
            chunks.clone(),
            metadata.clone(),
            events.clone(),
            config.compress(),
        );

        Ok(Self {
            files: FileService::new(
                metadata.clone(),
                chunks.clone(),
                assembler.clone(),
                writer.clone(),
                config.upload_session_ttl(),
            ),
            sync: DiffSyncEngine::new(
                metadata.clone(),
                chunks.clone(),
                assembler.clone(),
                writer.clone(),
            ),
            versions: VersionManager::new(metadata.clone(), assembler.clone(), writer.clone()),
            conflicts: ConflictResolver::new(metadata.clone(), writer),
            storage,
            metadata,
            chunks,
            assembler,
            events,
        })
    }

    /// Open the configured blob and metadata stores and build the engine.
    pub async fn from_config(config: &AppConfig) -> EngineResult<Self> {
        config.validate().map_err(EngineError::Validation)?;

        let storage = cirrus_storage::from_config(&config.storage)
            .await
            .map_err(|e| EngineError::Storage(StorageFailure::Blob(e)))?;
        let metadata = cirrus_metadata::from_config(&config.metadata)
            .await
            .map_err(|e| EngineError::Storage(StorageFailure::Metadata(e)))?;

        Self::new(storage, metadata, config.engine.clone())
    }

    pub fn files(&self) -> &FileService {
        &self.files
    }

    pub fn sync(&self) -> &DiffSyncEngine {
        &self.sync
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub fn conflicts(&self) -> &ConflictResolver {
        &self.conflicts
    }

    /// Receive every change published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn assembler(&self) -> &FileAssembler {
        &self.assembler
    }

    pub fn chunk_store(&self) -> &Arc<ChunkStore> {
        &self.chunks
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn storage(&self) -> &Arc<dyn BlobStore> {
        &self.storage
    }

    /// A reaper over this engine's stores.
    pub fn reaper(&self, config: GcConfig) -> Reaper {
        Reaper::new(
            self.chunks.clone(),
            self.metadata.clone(),
            self.storage.clone(),
            config,
        )
    }

    /// Check that both stores are reachable.
    pub async fn health_check(&self) -> EngineResult<()> {
        self.storage
            .health_check()
            .await
            .map_err(|e| EngineError::Storage(StorageFailure::Blob(e)))?;
        self.metadata
            .health_check()
            .await
            .map_err(|e| EngineError::Storage(StorageFailure::Metadata(e)))
    }

    pub async fn chunk_stats(&self) -> EngineResult<ChunkStats> {
        Ok(self.metadata.get_chunk_stats().await?)
    }
}
