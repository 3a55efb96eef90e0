//! Prometheus metrics for the storage engine.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Chunk metrics
pub static CHUNKS_STORED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cirrus_chunks_stored_total",
        "Total number of new chunks written to the blob store",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cirrus_chunks_deduplicated_total",
        "Total number of chunks reused from an existing copy",
    )
    .expect("metric creation failed")
});

pub static BYTES_STORED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cirrus_bytes_stored_total",
        "Total bytes written to the blob store (after compression)",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_PURGED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cirrus_chunks_purged_total",
        "Total number of chunks deleted after their last reference went away",
    )
    .expect("metric creation failed")
});

// Diff sync metrics
pub static DELTA_CHUNKS_APPLIED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cirrus_delta_chunks_applied_total",
        "Total number of chunks supplied by clients in delta uploads",
    )
    .expect("metric creation failed")
});

pub static DELTA_CHUNKS_REUSED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cirrus_delta_chunks_reused_total",
        "Total number of delta chunks taken from the base version",
    )
    .expect("metric creation failed")
});

// Versioning metrics
pub static VERSION_CONFLICTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cirrus_version_conflicts_total",
        "Total number of writes rejected by optimistic concurrency checks",
    )
    .expect("metric creation failed")
});

pub static VERSIONS_COMMITTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cirrus_versions_committed_total",
        "Total number of file versions committed",
    )
    .expect("metric creation failed")
});

// Upload session metrics
pub static UPLOAD_PARTS_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cirrus_upload_parts_received_total",
        "Total number of resumable upload parts received",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cirrus_upload_sessions_completed_total",
        "Total number of resumable uploads committed as file versions",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cirrus_upload_sessions_expired_total",
        "Total number of resumable upload sessions removed after expiry",
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once; only the first call registers.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let counters: [&IntCounter; 11] = [
            &CHUNKS_STORED,
            &CHUNKS_DEDUPLICATED,
            &BYTES_STORED,
            &CHUNKS_PURGED,
            &DELTA_CHUNKS_APPLIED,
            &DELTA_CHUNKS_REUSED,
            &VERSION_CONFLICTS,
            &VERSIONS_COMMITTED,
            &UPLOAD_PARTS_RECEIVED,
            &UPLOAD_SESSIONS_COMPLETED,
            &UPLOAD_SESSIONS_EXPIRED,
        ];
        for counter in counters {
            REGISTRY
                .register(Box::new(counter.clone()))
                .expect("metric registration failed");
        }
    });
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent_and_renders() {
        register_metrics();
        register_metrics();
        CHUNKS_STORED.inc();

        let text = render().unwrap();
        assert!(text.contains("cirrus_chunks_stored_total"));
        assert!(text.contains("cirrus_version_conflicts_total"));
    }
}
