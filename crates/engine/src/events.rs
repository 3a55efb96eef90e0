//! Change notifications.
//!
//! Every committed version, deletion, directory creation, restore and
//! rejected write is published on a broadcast channel. Subscribers that fall
//! more than the channel capacity behind miss the oldest events and see
//! `RecvError::Lagged`; publishing never waits for them.

use crate::error::{EngineError, EngineResult};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Something that changed in the file tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A new version of a file became current.
    Committed {
        file_id: Uuid,
        path: String,
        version: i64,
        size_bytes: i64,
        content_hash: String,
    },
    /// A write was rejected because the file had moved on.
    Conflict {
        file_id: Uuid,
        expected: i64,
        actual: i64,
    },
    /// An old version's content was committed as a new version.
    Restored {
        file_id: Uuid,
        from_version: i64,
        version: i64,
    },
    /// A file or an empty directory was removed.
    Deleted { file_id: Uuid, path: String },
    DirectoryCreated { file_id: Uuid, path: String },
}

impl ChangeEvent {
    pub fn file_id(&self) -> Uuid {
        match self {
            Self::Committed { file_id, .. }
            | Self::Conflict { file_id, .. }
            | Self::Restored { file_id, .. }
            | Self::Deleted { file_id, .. }
            | Self::DirectoryCreated { file_id, .. } => *file_id,
        }
    }
}

/// Sending side of the change channel, shared by every service.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<ChangeEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// A receiver for every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: ChangeEvent) {
        match self.sender.send(event) {
            Ok(receivers) => tracing::trace!(receivers, "Published change event"),
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!(file_id = %event.file_id(), "No subscribers for change event")
            }
        }
    }

    /// Pass `result` through, publishing a conflict event if it is a
    /// version conflict.
    pub(crate) fn conflicts<T>(&self, result: EngineResult<T>) -> EngineResult<T> {
        if let Err(EngineError::VersionConflict {
            file_id,
            expected,
            actual,
        }) = &result
        {
            self.publish(ChangeEvent::Conflict {
                file_id: *file_id,
                expected: *expected,
                actual: *actual,
            });
        }
        result
    }
}
