//! Integration tests for the SQLite metadata store.

mod common;

use cirrus_metadata::MetadataError;
use cirrus_metadata::models::*;
use cirrus_metadata::repos::CompletionClaim;
use common::TestMetadata;
use common::fixtures::{
    chunk_row, mapping_set, test_hash, upload_part, upload_session, version_commit,
};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

async fn setup() -> TestMetadata {
    TestMetadata::new()
        .await
        .expect("Failed to create metadata")
}

#[tokio::test]
async fn test_chunk_acquire_release_and_delete() {
    let metadata = setup().await;
    let store = metadata.store();

    let chunk = chunk_row("chunk-a", 100);
    let stored = store.insert_chunk_or_acquire(&chunk).await.unwrap();
    assert_eq!(stored.chunk_id, chunk.chunk_id);
    assert_eq!(stored.refcount, 1);
    assert_eq!(stored.chunk_state(), Some(ChunkState::Pending));

    let acquired = store
        .acquire_chunk_by_hash(&chunk.content_hash, OffsetDateTime::now_utc())
        .await
        .unwrap()
        .expect("chunk should exist");
    assert_eq!(acquired.refcount, 2);

    assert!(
        store
            .acquire_chunk_by_hash(&test_hash("missing"), OffsetDateTime::now_utc())
            .await
            .unwrap()
            .is_none()
    );

    // Still referenced: delete is refused
    assert!(
        store
            .delete_chunk_if_unreferenced(chunk.chunk_id)
            .await
            .unwrap()
            .is_none()
    );

    store.release_chunk(chunk.chunk_id).await.unwrap();
    let released = store.release_chunk(chunk.chunk_id).await.unwrap().unwrap();
    assert_eq!(released.refcount, 0);

    // Releasing never goes negative
    let again = store.release_chunk(chunk.chunk_id).await.unwrap().unwrap();
    assert_eq!(again.refcount, 0);

    let deleted = store
        .delete_chunk_if_unreferenced(chunk.chunk_id)
        .await
        .unwrap()
        .expect("unreferenced chunk should be deleted");
    assert_eq!(deleted.storage_key, chunk.storage_key);
    assert!(store.get_chunk(chunk.chunk_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_insert_same_hash_twice_acquires_winner() {
    let metadata = setup().await;
    let store = metadata.store();

    let first = chunk_row("shared", 64);
    let mut second = chunk_row("shared", 64);
    second.storage_key = "chunks/other".to_string();

    store.insert_chunk_or_acquire(&first).await.unwrap();
    let winner = store.insert_chunk_or_acquire(&second).await.unwrap();

    assert_eq!(winner.chunk_id, first.chunk_id);
    assert_eq!(winner.storage_key, first.storage_key);
    assert_eq!(winner.refcount, 2);
    assert!(store.get_chunk(second.chunk_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_get_chunks_batch() {
    let metadata = setup().await;
    let store = metadata.store();

    let a = chunk_row("a", 10);
    let b = chunk_row("b", 20);
    store.insert_chunk_or_acquire(&a).await.unwrap();
    store.insert_chunk_or_acquire(&b).await.unwrap();

    let found = store
        .get_chunks_batch(&[a.chunk_id, b.chunk_id, Uuid::new_v4()])
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[&b.chunk_id].size_bytes, 20);
}

#[tokio::test]
async fn test_mapping_set_rules() {
    let metadata = setup().await;
    let store = metadata.store();
    let file_id = Uuid::new_v4();

    let a = chunk_row("a", 10);
    let b = chunk_row("b", 20);
    store.insert_chunk_or_acquire(&a).await.unwrap();
    store.insert_chunk_or_acquire(&b).await.unwrap();

    assert!(matches!(
        store.insert_mapping_set(&[]).await,
        Err(MetadataError::Constraint(_))
    ));

    let mut gapped = mapping_set(file_id, 1, &[&a, &b]);
    gapped[1].offset_in_file += 1;
    assert!(matches!(
        store.insert_mapping_set(&gapped).await,
        Err(MetadataError::Constraint(_))
    ));

    let mut reordered = mapping_set(file_id, 1, &[&a, &b]);
    reordered.swap(0, 1);
    assert!(matches!(
        store.insert_mapping_set(&reordered).await,
        Err(MetadataError::Constraint(_))
    ));

    let ghost = chunk_row("never-stored", 10);
    match store
        .insert_mapping_set(&mapping_set(file_id, 1, &[&a, &ghost]))
        .await
    {
        Err(MetadataError::UnknownChunk(id)) => assert_eq!(id, ghost.chunk_id),
        other => panic!("expected UnknownChunk, got {other:?}"),
    }
    // A failed insert leaves nothing behind
    assert!(store.get_mapping_set(file_id, 1).await.unwrap().is_empty());

    let rows = mapping_set(file_id, 1, &[&a, &b]);
    store.insert_mapping_set(&rows).await.unwrap();
    let loaded = store.get_mapping_set(file_id, 1).await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[1].offset_in_file, 10);

    // Second writer for the same version slot loses
    match store.insert_mapping_set(&rows).await {
        Err(MetadataError::SlotTaken { file_id: id, version }) => {
            assert_eq!((id, version), (file_id, 1));
        }
        other => panic!("expected SlotTaken, got {other:?}"),
    }
}

#[tokio::test]
async fn test_committed_slot_stays_closed_after_retire() {
    let metadata = setup().await;
    let store = metadata.store();
    let file_id = Uuid::new_v4();
    let a = chunk_row("committed", 10);
    let b = chunk_row("intruder", 10);
    store.insert_chunk_or_acquire(&a).await.unwrap();
    store.insert_chunk_or_acquire(&b).await.unwrap();

    store
        .insert_mapping_set(&mapping_set(file_id, 1, &[&a]))
        .await
        .unwrap();
    store
        .commit_version(&version_commit(file_id, "fixed.txt", 1, None, &[&a]))
        .await
        .unwrap();
    store.retire_mapping_set(file_id, 1).await.unwrap();

    let refill = store
        .insert_mapping_set(&mapping_set(file_id, 1, &[&b]))
        .await;
    assert!(matches!(
        refill,
        Err(MetadataError::SlotTaken { version: 1, .. })
    ));
    assert!(store.get_mapping_set(file_id, 1).await.unwrap().is_empty());

    // The next slot is still open
    store
        .insert_mapping_set(&mapping_set(file_id, 2, &[&b]))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_commit_version_creates_and_advances_file() {
    let metadata = setup().await;
    let store = metadata.store();
    let file_id = Uuid::new_v4();

    let a = chunk_row("v1", 10);
    store.insert_chunk_or_acquire(&a).await.unwrap();
    store
        .insert_mapping_set(&mapping_set(file_id, 1, &[&a]))
        .await
        .unwrap();

    let file = store
        .commit_version(&version_commit(file_id, "report.docx", 1, None, &[&a]))
        .await
        .unwrap();
    assert_eq!(file.current_version, 1);
    assert_eq!(file.full_path(), "/docs/report.docx");
    assert!(!file.is_directory);

    let chunk = store.get_chunk(a.chunk_id).await.unwrap().unwrap();
    assert_eq!(chunk.chunk_state(), Some(ChunkState::Committed));

    let b = chunk_row("v2", 15);
    store.insert_chunk_or_acquire(&b).await.unwrap();
    store
        .insert_mapping_set(&mapping_set(file_id, 2, &[&b]))
        .await
        .unwrap();
    let file = store
        .commit_version(&version_commit(file_id, "report.docx", 2, Some(1), &[&b]))
        .await
        .unwrap();
    assert_eq!(file.current_version, 2);
    assert_eq!(file.size_bytes, 15);

    let versions = store.list_versions(file_id).await.unwrap();
    assert_eq!(
        versions.iter().map(|v| v.version_number).collect::<Vec<_>>(),
        vec![2, 1]
    );
    assert_eq!(versions[0].storage_marker, STORAGE_MARKER_CHUNKED);
}

#[tokio::test]
async fn test_commit_version_conflicts() {
    let metadata = setup().await;
    let store = metadata.store();
    let file_id = Uuid::new_v4();

    let a = chunk_row("a", 10);
    store.insert_chunk_or_acquire(&a).await.unwrap();
    store
        .insert_mapping_set(&mapping_set(file_id, 1, &[&a]))
        .await
        .unwrap();
    store
        .commit_version(&version_commit(file_id, "f.txt", 1, None, &[&a]))
        .await
        .unwrap();

    // Two writers both based on version 1
    store.acquire_chunk(a.chunk_id, OffsetDateTime::now_utc()).await.unwrap();
    store
        .insert_mapping_set(&mapping_set(file_id, 2, &[&a]))
        .await
        .unwrap();
    store
        .commit_version(&version_commit(file_id, "f.txt", 2, Some(1), &[&a]))
        .await
        .unwrap();

    store.acquire_chunk(a.chunk_id, OffsetDateTime::now_utc()).await.unwrap();
    store
        .insert_mapping_set(&mapping_set(file_id, 3, &[&a]))
        .await
        .unwrap();
    match store
        .commit_version(&version_commit(file_id, "f.txt", 3, Some(1), &[&a]))
        .await
    {
        Err(MetadataError::Constraint(_)) => {}
        other => panic!("expected Constraint for a skipped version, got {other:?}"),
    }
    match store
        .commit_version(&version_commit(file_id, "f.txt", 3, Some(2), &[&a]))
        .await
    {
        Ok(file) => assert_eq!(file.current_version, 3),
        other => panic!("expected commit, got {other:?}"),
    }

    let stale = version_commit(file_id, "f.txt", 3, Some(2), &[&a]);
    match store.commit_version(&stale).await {
        Err(MetadataError::VersionConflict {
            expected, actual, ..
        }) => {
            assert_eq!(expected, 2);
            assert_eq!(actual, 3);
        }
        other => panic!("expected VersionConflict, got {other:?}"),
    }

    let unknown = version_commit(Uuid::new_v4(), "x", 2, Some(1), &[&a]);
    assert!(matches!(
        store.commit_version(&unknown).await,
        Err(MetadataError::NotFound(_))
    ));

    // Same path as an existing file
    let other_id = Uuid::new_v4();
    store.acquire_chunk(a.chunk_id, OffsetDateTime::now_utc()).await.unwrap();
    store
        .insert_mapping_set(&mapping_set(other_id, 1, &[&a]))
        .await
        .unwrap();
    assert!(matches!(
        store
            .commit_version(&version_commit(other_id, "f.txt", 1, None, &[&a]))
            .await,
        Err(MetadataError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn test_commit_requires_complete_mapping_set() {
    let metadata = setup().await;
    let store = metadata.store();
    let file_id = Uuid::new_v4();
    let a = chunk_row("a", 10);

    let result = store
        .commit_version(&version_commit(file_id, "lonely.txt", 1, None, &[&a]))
        .await;
    assert!(matches!(result, Err(MetadataError::Constraint(_))));

    // The transaction rolled back the file row too
    assert!(store.get_file(file_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_retire_mapping_set_releases_each_row() {
    let metadata = setup().await;
    let store = metadata.store();
    let file_id = Uuid::new_v4();

    let a = chunk_row("repeated", 10);
    let b = chunk_row("shared", 10);
    store.insert_chunk_or_acquire(&a).await.unwrap();
    store.insert_chunk_or_acquire(&b).await.unwrap();
    // Second reference on `a` for its second occurrence, one extra on `b` held elsewhere
    store.acquire_chunk(a.chunk_id, OffsetDateTime::now_utc()).await.unwrap();
    store.acquire_chunk(b.chunk_id, OffsetDateTime::now_utc()).await.unwrap();

    store
        .insert_mapping_set(&mapping_set(file_id, 1, &[&a, &b, &a]))
        .await
        .unwrap();

    let retired = store.retire_mapping_set(file_id, 1).await.unwrap();
    assert_eq!(retired.mappings.len(), 3);
    assert_eq!(retired.unreferenced.len(), 1);
    assert_eq!(retired.unreferenced[0].chunk_id, a.chunk_id);

    let b_now = store.get_chunk(b.chunk_id).await.unwrap().unwrap();
    assert_eq!(b_now.refcount, 1);
    assert!(store.get_mapping_set(file_id, 1).await.unwrap().is_empty());

    let nothing = store.retire_mapping_set(file_id, 1).await.unwrap();
    assert!(nothing.mappings.is_empty());
}

#[tokio::test]
async fn test_orphan_mapping_sets_respect_grace() {
    let metadata = setup().await;
    let store = metadata.store();
    let committed_id = Uuid::new_v4();
    let orphan_id = Uuid::new_v4();

    let a = chunk_row("a", 10);
    store.insert_chunk_or_acquire(&a).await.unwrap();
    store.acquire_chunk(a.chunk_id, OffsetDateTime::now_utc()).await.unwrap();

    store
        .insert_mapping_set(&mapping_set(committed_id, 1, &[&a]))
        .await
        .unwrap();
    store
        .commit_version(&version_commit(committed_id, "kept", 1, None, &[&a]))
        .await
        .unwrap();
    store
        .insert_mapping_set(&mapping_set(orphan_id, 1, &[&a]))
        .await
        .unwrap();

    let cutoff = OffsetDateTime::now_utc() - Duration::hours(1);
    assert!(
        store
            .list_orphan_mapping_sets(cutoff, 100)
            .await
            .unwrap()
            .is_empty()
    );

    sqlx::query("UPDATE chunk_mappings SET created_at = ?")
        .bind(OffsetDateTime::now_utc() - Duration::hours(2))
        .execute(metadata.pool())
        .await
        .unwrap();

    let orphans = store.list_orphan_mapping_sets(cutoff, 100).await.unwrap();
    assert_eq!(
        orphans,
        vec![MappingSetRef {
            file_id: orphan_id,
            version_number: 1
        }]
    );
}

#[tokio::test]
async fn test_stale_pending_chunks() {
    let metadata = setup().await;
    let store = metadata.store();

    let stale = chunk_row("stale", 10);
    let mapped = chunk_row("mapped", 10);
    store.insert_chunk_or_acquire(&stale).await.unwrap();
    store.insert_chunk_or_acquire(&mapped).await.unwrap();
    store
        .insert_mapping_set(&mapping_set(Uuid::new_v4(), 1, &[&mapped]))
        .await
        .unwrap();

    sqlx::query("UPDATE chunks SET last_referenced_at = ?")
        .bind(OffsetDateTime::now_utc() - Duration::hours(2))
        .execute(metadata.pool())
        .await
        .unwrap();

    let cutoff = OffsetDateTime::now_utc() - Duration::hours(1);
    let candidates = store.list_stale_pending_chunks(cutoff, 100).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].chunk_id, stale.chunk_id);

    // A fresh acquire moves the chunk out of the stale window
    store
        .acquire_chunk(stale.chunk_id, OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert!(
        store
            .delete_stale_pending_chunk(stale.chunk_id, cutoff)
            .await
            .unwrap()
            .is_none()
    );

    assert!(
        store
            .delete_stale_pending_chunk(mapped.chunk_id, cutoff)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_unreferenced_chunks_and_stats() {
    let metadata = setup().await;
    let store = metadata.store();

    let a = chunk_row("a", 100);
    let b = chunk_row("b", 50);
    store.insert_chunk_or_acquire(&a).await.unwrap();
    store.insert_chunk_or_acquire(&b).await.unwrap();
    store.release_chunk(b.chunk_id).await.unwrap();

    let stats = store.get_chunk_stats().await.unwrap();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.total_size, 150);
    assert_eq!(stats.unreferenced_count, 1);
    assert_eq!(stats.pending_count, 2);

    let later = OffsetDateTime::now_utc() + Duration::seconds(1);
    let unreferenced = store.list_unreferenced_chunks(later, 10).await.unwrap();
    assert_eq!(unreferenced.len(), 1);
    assert_eq!(unreferenced[0].chunk_id, b.chunk_id);

    let earlier = OffsetDateTime::now_utc() - Duration::hours(1);
    assert!(
        store
            .list_unreferenced_chunks(earlier, 10)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_directories_and_listing_order() {
    let metadata = setup().await;
    let store = metadata.store();
    let now = OffsetDateTime::now_utc();

    let dir = |name: &str| FileRow {
        file_id: Uuid::new_v4(),
        path: "/docs".to_string(),
        name: name.to_string(),
        is_directory: true,
        current_version: 0,
        size_bytes: 0,
        content_hash: None,
        created_at: now,
        updated_at: now,
    };

    store.create_directory(&dir("zeta")).await.unwrap();
    store.create_directory(&dir("alpha")).await.unwrap();
    assert!(matches!(
        store.create_directory(&dir("alpha")).await,
        Err(MetadataError::AlreadyExists(_))
    ));

    let a = chunk_row("a", 10);
    store.insert_chunk_or_acquire(&a).await.unwrap();
    let file_id = Uuid::new_v4();
    store
        .insert_mapping_set(&mapping_set(file_id, 1, &[&a]))
        .await
        .unwrap();
    store
        .commit_version(&version_commit(file_id, "beta.txt", 1, None, &[&a]))
        .await
        .unwrap();

    let names: Vec<String> = store
        .list_directory("/docs")
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(names, vec!["alpha", "zeta", "beta.txt"]);

    let found = store
        .get_file_by_path("/docs", "beta.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.file_id, file_id);
    assert!(store.list_directory("/elsewhere").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_file_returns_mapped_versions() {
    let metadata = setup().await;
    let store = metadata.store();
    let file_id = Uuid::new_v4();

    let a = chunk_row("a", 10);
    store.insert_chunk_or_acquire(&a).await.unwrap();
    store
        .insert_mapping_set(&mapping_set(file_id, 1, &[&a]))
        .await
        .unwrap();
    let commit = version_commit(file_id, "gone.txt", 1, None, &[&a]);
    store.commit_version(&commit).await.unwrap();

    let found = store
        .find_version_by_content_hash(&commit.content_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.file_id, file_id);

    let mapped = store.delete_file(file_id).await.unwrap();
    assert_eq!(mapped, vec![1]);
    assert!(store.get_file(file_id).await.unwrap().is_none());
    assert!(store.list_versions(file_id).await.unwrap().is_empty());
    // Mapping sets outlive the file until the caller retires them
    assert_eq!(store.list_mapped_versions(file_id).await.unwrap(), vec![1]);

    assert!(matches!(
        store.delete_file(file_id).await,
        Err(MetadataError::NotFound(_))
    ));

    store.retire_mapping_set(file_id, 1).await.unwrap();
    assert!(
        store
            .find_version_by_content_hash(&commit.content_hash)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_upload_session_parts_and_completion() {
    let metadata = setup().await;
    let store = metadata.store();
    let session = upload_session(25, 10, Duration::hours(24));
    store.create_session(&session).await.unwrap();

    let first = chunk_row("part-0", 10);
    let retry = chunk_row("part-0-retry", 10);
    let last = chunk_row("part-2", 5);
    for chunk in [&first, &retry, &last] {
        store.insert_chunk_or_acquire(chunk).await.unwrap();
    }

    assert!(
        store
            .record_part(&upload_part(&session, 0, &first))
            .await
            .unwrap()
            .is_none()
    );
    store
        .record_part(&upload_part(&session, 2, &last))
        .await
        .unwrap();
    // Re-sending a part hands the earlier part back to the caller
    let replaced = store
        .record_part(&upload_part(&session, 0, &retry))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replaced.chunk_id, first.chunk_id);

    let parts = store.list_parts(session.session_id).await.unwrap();
    let indexes: Vec<i64> = parts.iter().map(|p| p.part_index).collect();
    assert_eq!(indexes, vec![0, 2]);
    assert_eq!(parts[0].chunk_id, retry.chunk_id);

    // Only one caller wins the completion claim
    match store
        .begin_complete_session(session.session_id, OffsetDateTime::now_utc())
        .await
        .unwrap()
    {
        Some(CompletionClaim::Claimed(row)) => {
            assert_eq!(row.session_state(), Some(SessionState::Completing));
        }
        other => panic!("expected a claim, got {other:?}"),
    }
    match store
        .begin_complete_session(session.session_id, OffsetDateTime::now_utc())
        .await
        .unwrap()
    {
        Some(CompletionClaim::Unavailable(row)) => {
            assert_eq!(row.session_state(), Some(SessionState::Completing));
        }
        other => panic!("expected the claim to be refused, got {other:?}"),
    }
    assert!(
        store
            .begin_complete_session(Uuid::new_v4(), OffsetDateTime::now_utc())
            .await
            .unwrap()
            .is_none()
    );

    // Parts are refused while completing
    assert!(matches!(
        store
            .record_part(&upload_part(&session, 1, &first))
            .await,
        Err(MetadataError::Constraint(_))
    ));

    let file_id = Uuid::new_v4();
    let released = store
        .finish_session(session.session_id, file_id, &test_hash("whole"), OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert_eq!(released.len(), 2);
    assert!(store.list_parts(session.session_id).await.unwrap().is_empty());

    let finished = store.get_session(session.session_id).await.unwrap().unwrap();
    assert_eq!(finished.session_state(), Some(SessionState::Completed));
    assert_eq!(finished.file_id, Some(file_id));
    assert!(store.get_session(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_sessions_and_part_protection() {
    let metadata = setup().await;
    let store = metadata.store();
    let live = upload_session(10, 10, Duration::hours(24));
    let expired = upload_session(10, 10, Duration::hours(-1));
    store.create_session(&live).await.unwrap();
    store.create_session(&expired).await.unwrap();

    let held = chunk_row("held-by-session", 10);
    store.insert_chunk_or_acquire(&held).await.unwrap();
    store
        .record_part(&upload_part(&live, 0, &held))
        .await
        .unwrap();

    // Expired sessions take no more parts
    let late = store.record_part(&upload_part(&expired, 0, &held)).await;
    assert!(matches!(late, Err(MetadataError::Constraint(_))));
    let unknown = upload_session(10, 10, Duration::hours(1));
    assert!(matches!(
        store.record_part(&upload_part(&unknown, 0, &held)).await,
        Err(MetadataError::NotFound(_))
    ));

    // A chunk held by a session part is not a stale leftover
    sqlx::query("UPDATE chunks SET last_referenced_at = ?")
        .bind(OffsetDateTime::now_utc() - Duration::hours(2))
        .execute(metadata.pool())
        .await
        .unwrap();
    let cutoff = OffsetDateTime::now_utc() - Duration::hours(1);
    assert!(
        store
            .list_stale_pending_chunks(cutoff, 100)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        store
            .delete_stale_pending_chunk(held.chunk_id, cutoff)
            .await
            .unwrap()
            .is_none()
    );

    let due = store
        .list_expired_sessions(OffsetDateTime::now_utc(), 100)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].session_id, expired.session_id);

    let parts = store.delete_session(live.session_id).await.unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].chunk_id, held.chunk_id);
    assert!(store.get_session(live.session_id).await.unwrap().is_none());
    assert_eq!(store.list_sessions().await.unwrap().len(), 1);
}
