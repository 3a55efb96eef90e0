//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{ChunkRepo, FileRepo, MappingRepo, UploadRepo, VersionRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    ChunkRepo + MappingRepo + VersionRepo + FileRepo + UploadRepo + Send + Sync
{
    /// Create the schema if it does not exist.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) a SQLite database and apply the schema.
    pub async fn new(path: impl AsRef<Path>, busy_timeout: Duration) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        // A single connection serializes writers. Every refcount change is a
        // single statement or transaction, so serialization is what makes
        // acquire/purge races impossible.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "SQLite metadata store ready");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::{ChunkStats, CompletionClaim, RetiredMappingSet, VersionCommit};
    use std::collections::HashMap;
    use time::OffsetDateTime;
    use uuid::Uuid;

    /// SQLite has a limit of ~999 bound parameters per statement.
    const BATCH_SIZE: usize = 900;

    #[async_trait]
    impl ChunkRepo for SqliteStore {
        async fn get_chunk(&self, chunk_id: Uuid) -> MetadataResult<Option<ChunkRow>> {
            let row = sqlx::query_as::<_, ChunkRow>("SELECT * FROM chunks WHERE chunk_id = ?")
                .bind(chunk_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_chunk_by_hash(&self, content_hash: &str) -> MetadataResult<Option<ChunkRow>> {
            let row =
                sqlx::query_as::<_, ChunkRow>("SELECT * FROM chunks WHERE content_hash = ?")
                    .bind(content_hash)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn get_chunks_batch(
            &self,
            chunk_ids: &[Uuid],
        ) -> MetadataResult<HashMap<Uuid, ChunkRow>> {
            let mut result = HashMap::with_capacity(chunk_ids.len());

            for batch in chunk_ids.chunks(BATCH_SIZE) {
                let placeholders = vec!["?"; batch.len()].join(", ");
                let query = format!("SELECT * FROM chunks WHERE chunk_id IN ({placeholders})");

                let mut query_builder = sqlx::query_as::<_, ChunkRow>(&query);
                for id in batch {
                    query_builder = query_builder.bind(id);
                }

                for row in query_builder.fetch_all(&self.pool).await? {
                    result.insert(row.chunk_id, row);
                }
            }

            Ok(result)
        }

        async fn acquire_chunk_by_hash(
            &self,
            content_hash: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<Option<ChunkRow>> {
            let row = sqlx::query_as::<_, ChunkRow>(
                r#"
                UPDATE chunks SET refcount = refcount + 1, last_referenced_at = ?
                WHERE content_hash = ?
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn acquire_chunk(
            &self,
            chunk_id: Uuid,
            now: OffsetDateTime,
        ) -> MetadataResult<Option<ChunkRow>> {
            let row = sqlx::query_as::<_, ChunkRow>(
                r#"
                UPDATE chunks SET refcount = refcount + 1, last_referenced_at = ?
                WHERE chunk_id = ?
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn insert_chunk_or_acquire(&self, chunk: &ChunkRow) -> MetadataResult<ChunkRow> {
            let row = sqlx::query_as::<_, ChunkRow>(
                r#"
                INSERT INTO chunks (
                    chunk_id, content_hash, storage_key, size_bytes, stored_bytes,
                    compressed, refcount, state, created_at, last_referenced_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(content_hash) DO UPDATE SET
                    refcount = refcount + 1,
                    last_referenced_at = excluded.last_referenced_at
                RETURNING *
                "#,
            )
            .bind(chunk.chunk_id)
            .bind(&chunk.content_hash)
            .bind(&chunk.storage_key)
            .bind(chunk.size_bytes)
            .bind(chunk.stored_bytes)
            .bind(chunk.compressed)
            .bind(chunk.refcount)
            .bind(&chunk.state)
            .bind(chunk.created_at)
            .bind(chunk.last_referenced_at)
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn release_chunk(&self, chunk_id: Uuid) -> MetadataResult<Option<ChunkRow>> {
            let row = sqlx::query_as::<_, ChunkRow>(
                "UPDATE chunks SET refcount = MAX(0, refcount - 1) WHERE chunk_id = ? RETURNING *",
            )
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn delete_chunk_if_unreferenced(
            &self,
            chunk_id: Uuid,
        ) -> MetadataResult<Option<ChunkRow>> {
            let row = sqlx::query_as::<_, ChunkRow>(
                r#"
                DELETE FROM chunks
                WHERE chunk_id = ?
                  AND refcount = 0
                  AND NOT EXISTS (SELECT 1 FROM chunk_mappings m WHERE m.chunk_id = chunks.chunk_id)
                  AND NOT EXISTS (SELECT 1 FROM upload_parts p WHERE p.chunk_id = chunks.chunk_id)
                RETURNING *
                "#,
            )
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_unreferenced_chunks(
            &self,
            older_than: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<ChunkRow>> {
            let rows = sqlx::query_as::<_, ChunkRow>(
                r#"
                SELECT * FROM chunks
                WHERE refcount = 0 AND last_referenced_at < ?
                ORDER BY last_referenced_at
                LIMIT ?
                "#,
            )
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn list_stale_pending_chunks(
            &self,
            older_than: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<ChunkRow>> {
            let rows = sqlx::query_as::<_, ChunkRow>(
                r#"
                SELECT * FROM chunks
                WHERE state = 'pending'
                  AND last_referenced_at < ?
                  AND NOT EXISTS (SELECT 1 FROM chunk_mappings m WHERE m.chunk_id = chunks.chunk_id)
                  AND NOT EXISTS (SELECT 1 FROM upload_parts p WHERE p.chunk_id = chunks.chunk_id)
                ORDER BY last_referenced_at
                LIMIT ?
                "#,
            )
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_stale_pending_chunk(
            &self,
            chunk_id: Uuid,
            older_than: OffsetDateTime,
        ) -> MetadataResult<Option<ChunkRow>> {
            let row = sqlx::query_as::<_, ChunkRow>(
                r#"
                DELETE FROM chunks
                WHERE chunk_id = ?
                  AND state = 'pending'
                  AND last_referenced_at < ?
                  AND NOT EXISTS (SELECT 1 FROM chunk_mappings m WHERE m.chunk_id = chunks.chunk_id)
                  AND NOT EXISTS (SELECT 1 FROM upload_parts p WHERE p.chunk_id = chunks.chunk_id)
                RETURNING *
                "#,
            )
            .bind(chunk_id)
            .bind(older_than)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_chunk_stats(&self) -> MetadataResult<ChunkStats> {
            let (count, total_size, stored_size, unreferenced, pending): (i64, i64, i64, i64, i64) =
                sqlx::query_as(
                    r#"
                    SELECT
                        COUNT(*),
                        COALESCE(SUM(size_bytes), 0),
                        COALESCE(SUM(stored_bytes), 0),
                        COALESCE(SUM(CASE WHEN refcount = 0 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END), 0)
                    FROM chunks
                    "#,
                )
                .fetch_one(&self.pool)
                .await?;

            Ok(ChunkStats {
                count: count as u64,
                total_size: total_size as u64,
                stored_size: stored_size as u64,
                unreferenced_count: unreferenced as u64,
                pending_count: pending as u64,
            })
        }
    }

    /// Check the layout rules of a mapping set before writing it.
    fn check_mapping_set(rows: &[ChunkMappingRow]) -> MetadataResult<()> {
        let Some(first) = rows.first() else {
            return Err(MetadataError::Constraint(
                "mapping set cannot be empty".to_string(),
            ));
        };

        let mut expected_offset = 0i64;
        for (i, row) in rows.iter().enumerate() {
            if row.file_id != first.file_id || row.version_number != first.version_number {
                return Err(MetadataError::Constraint(
                    "mapping set spans more than one file version".to_string(),
                ));
            }
            if row.sequence_number != i as i64 {
                return Err(MetadataError::Constraint(format!(
                    "sequence number {} at position {i}",
                    row.sequence_number
                )));
            }
            if row.offset_in_file != expected_offset || row.size_bytes <= 0 {
                return Err(MetadataError::Constraint(format!(
                    "chunk {i} covers [{}, +{}) but the previous chunk ended at {expected_offset}",
                    row.offset_in_file, row.size_bytes
                )));
            }
            expected_offset += row.size_bytes;
        }
        Ok(())
    }

    #[async_trait]
    impl MappingRepo for SqliteStore {
        async fn insert_mapping_set(&self, rows: &[ChunkMappingRow]) -> MetadataResult<()> {
            check_mapping_set(rows)?;

            let mut tx = self.pool.begin().await?;

            // A committed version's slot stays closed after its set is retired
            let (file_id, version_number) = (rows[0].file_id, rows[0].version_number);
            let committed: Option<i64> = sqlx::query_scalar(
                "SELECT version_number FROM file_versions WHERE file_id = ? AND version_number = ?",
            )
            .bind(file_id)
            .bind(version_number)
            .fetch_optional(&mut *tx)
            .await?;
            if committed.is_some() {
                return Err(MetadataError::SlotTaken {
                    file_id,
                    version: version_number,
                });
            }

            for row in rows {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO chunk_mappings (
                        file_id, version_number, sequence_number, chunk_id,
                        offset_in_file, size_bytes, created_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(row.file_id)
                .bind(row.version_number)
                .bind(row.sequence_number)
                .bind(row.chunk_id)
                .bind(row.offset_in_file)
                .bind(row.size_bytes)
                .bind(row.created_at)
                .execute(&mut *tx)
                .await;

                match inserted {
                    Ok(_) => {}
                    Err(e) if MetadataError::is_unique_violation(&e) => {
                        return Err(MetadataError::SlotTaken {
                            file_id,
                            version: version_number,
                        });
                    }
                    Err(sqlx::Error::Database(db_err))
                        if db_err.message().contains("FOREIGN KEY constraint") =>
                    {
                        return Err(MetadataError::UnknownChunk(row.chunk_id));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            tx.commit().await?;
            Ok(())
        }

        async fn get_mapping_set(
            &self,
            file_id: Uuid,
            version_number: i64,
        ) -> MetadataResult<Vec<ChunkMappingRow>> {
            let rows = sqlx::query_as::<_, ChunkMappingRow>(
                r#"
                SELECT * FROM chunk_mappings
                WHERE file_id = ? AND version_number = ?
                ORDER BY sequence_number
                "#,
            )
            .bind(file_id)
            .bind(version_number)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn retire_mapping_set(
            &self,
            file_id: Uuid,
            version_number: i64,
        ) -> MetadataResult<RetiredMappingSet> {
            let mut tx = self.pool.begin().await?;

            let mut mappings = sqlx::query_as::<_, ChunkMappingRow>(
                "DELETE FROM chunk_mappings WHERE file_id = ? AND version_number = ? RETURNING *",
            )
            .bind(file_id)
            .bind(version_number)
            .fetch_all(&mut *tx)
            .await?;
            mappings.sort_by_key(|m| m.sequence_number);

            // A chunk repeated within the file is released once per mapping row
            let mut touched: HashMap<Uuid, ChunkRow> = HashMap::new();
            for mapping in &mappings {
                let row = sqlx::query_as::<_, ChunkRow>(
                    "UPDATE chunks SET refcount = MAX(0, refcount - 1) WHERE chunk_id = ? RETURNING *",
                )
                .bind(mapping.chunk_id)
                .fetch_optional(&mut *tx)
                .await?;
                match row {
                    Some(row) => {
                        touched.insert(row.chunk_id, row);
                    }
                    None => tracing::warn!(
                        chunk_id = %mapping.chunk_id,
                        file_id = %file_id,
                        version = version_number,
                        "mapping referenced a missing chunk"
                    ),
                }
            }

            tx.commit().await?;

            let unreferenced = touched.into_values().filter(|c| c.refcount == 0).collect();
            Ok(RetiredMappingSet {
                mappings,
                unreferenced,
            })
        }

        async fn list_mapped_versions(&self, file_id: Uuid) -> MetadataResult<Vec<i64>> {
            let versions = sqlx::query_scalar::<_, i64>(
                "SELECT DISTINCT version_number FROM chunk_mappings WHERE file_id = ? ORDER BY version_number",
            )
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(versions)
        }

        async fn list_orphan_mapping_sets(
            &self,
            older_than: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<MappingSetRef>> {
            let rows = sqlx::query_as::<_, MappingSetRef>(
                r#"
                SELECT m.file_id, m.version_number
                FROM chunk_mappings m
                WHERE NOT EXISTS (
                    SELECT 1 FROM file_versions v
                    WHERE v.file_id = m.file_id AND v.version_number = m.version_number
                )
                GROUP BY m.file_id, m.version_number
                HAVING MAX(m.created_at) < ?
                LIMIT ?
                "#,
            )
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl VersionRepo for SqliteStore {
        async fn commit_version(&self, commit: &VersionCommit) -> MetadataResult<FileRow> {
            let expected_number = commit.expected_current.unwrap_or(0) + 1;
            if commit.version_number != expected_number {
                return Err(MetadataError::Constraint(format!(
                    "version {} cannot follow version {}",
                    commit.version_number,
                    expected_number - 1
                )));
            }

            let mut tx = self.pool.begin().await?;

            match commit.expected_current {
                None => {
                    let inserted = sqlx::query(
                        r#"
                        INSERT INTO files (
                            file_id, path, name, is_directory, current_version,
                            size_bytes, content_hash, created_at, updated_at
                        ) VALUES (?, ?, ?, 0, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(commit.file_id)
                    .bind(&commit.path)
                    .bind(&commit.name)
                    .bind(commit.version_number)
                    .bind(commit.size_bytes)
                    .bind(&commit.content_hash)
                    .bind(commit.committed_at)
                    .bind(commit.committed_at)
                    .execute(&mut *tx)
                    .await;

                    match inserted {
                        Ok(_) => {}
                        Err(e) if MetadataError::is_unique_violation(&e) => {
                            return Err(MetadataError::AlreadyExists(cirrus_core::path::join(
                                &commit.path,
                                &commit.name,
                            )));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(expected) => {
                    let updated = sqlx::query(
                        r#"
                        UPDATE files
                        SET current_version = ?, size_bytes = ?, content_hash = ?, updated_at = ?
                        WHERE file_id = ? AND current_version = ? AND is_directory = 0
                        "#,
                    )
                    .bind(commit.version_number)
                    .bind(commit.size_bytes)
                    .bind(&commit.content_hash)
                    .bind(commit.committed_at)
                    .bind(commit.file_id)
                    .bind(expected)
                    .execute(&mut *tx)
                    .await?;

                    if updated.rows_affected() == 0 {
                        let actual: Option<i64> = sqlx::query_scalar(
                            "SELECT current_version FROM files WHERE file_id = ? AND is_directory = 0",
                        )
                        .bind(commit.file_id)
                        .fetch_optional(&mut *tx)
                        .await?;

                        return Err(match actual {
                            Some(actual) => MetadataError::VersionConflict {
                                file_id: commit.file_id,
                                expected,
                                actual,
                            },
                            None => MetadataError::NotFound(format!("file {}", commit.file_id)),
                        });
                    }
                }
            }

            let (mapped, mapped_size): (i64, i64) = sqlx::query_as(
                r#"
                SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM chunk_mappings
                WHERE file_id = ? AND version_number = ?
                "#,
            )
            .bind(commit.file_id)
            .bind(commit.version_number)
            .fetch_one(&mut *tx)
            .await?;

            if mapped == 0 || mapped != commit.chunk_count || mapped_size != commit.size_bytes {
                return Err(MetadataError::Constraint(format!(
                    "file {} version {} maps {mapped} chunks / {mapped_size} bytes, expected {} / {}",
                    commit.file_id, commit.version_number, commit.chunk_count, commit.size_bytes
                )));
            }

            sqlx::query(
                r#"
                INSERT INTO file_versions (
                    file_id, version_number, storage_marker, size_bytes,
                    content_hash, chunk_count, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(commit.file_id)
            .bind(commit.version_number)
            .bind(STORAGE_MARKER_CHUNKED)
            .bind(commit.size_bytes)
            .bind(&commit.content_hash)
            .bind(commit.chunk_count)
            .bind(commit.committed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if MetadataError::is_unique_violation(&e) {
                    MetadataError::Constraint(format!(
                        "file {} already has version {}",
                        commit.file_id, commit.version_number
                    ))
                } else {
                    e.into()
                }
            })?;

            sqlx::query(
                r#"
                UPDATE chunks SET state = 'committed'
                WHERE state = 'pending'
                  AND chunk_id IN (
                    SELECT chunk_id FROM chunk_mappings
                    WHERE file_id = ? AND version_number = ?
                  )
                "#,
            )
            .bind(commit.file_id)
            .bind(commit.version_number)
            .execute(&mut *tx)
            .await?;

            let file = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE file_id = ?")
                .bind(commit.file_id)
                .fetch_one(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(file)
        }

        async fn get_version(
            &self,
            file_id: Uuid,
            version_number: i64,
        ) -> MetadataResult<Option<FileVersionRow>> {
            let row = sqlx::query_as::<_, FileVersionRow>(
                "SELECT * FROM file_versions WHERE file_id = ? AND version_number = ?",
            )
            .bind(file_id)
            .bind(version_number)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_versions(&self, file_id: Uuid) -> MetadataResult<Vec<FileVersionRow>> {
            let rows = sqlx::query_as::<_, FileVersionRow>(
                "SELECT * FROM file_versions WHERE file_id = ? ORDER BY version_number DESC",
            )
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn find_version_by_content_hash(
            &self,
            content_hash: &str,
        ) -> MetadataResult<Option<FileVersionRow>> {
            let row = sqlx::query_as::<_, FileVersionRow>(
                r#"
                SELECT v.* FROM file_versions v
                WHERE v.content_hash = ?
                  AND EXISTS (
                    SELECT 1 FROM chunk_mappings m
                    WHERE m.file_id = v.file_id AND m.version_number = v.version_number
                  )
                ORDER BY v.created_at DESC
                LIMIT 1
                "#,
            )
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }
    }

    #[async_trait]
    impl FileRepo for SqliteStore {
        async fn create_directory(&self, dir: &FileRow) -> MetadataResult<()> {
            let inserted = sqlx::query(
                r#"
                INSERT INTO files (
                    file_id, path, name, is_directory, current_version,
                    size_bytes, content_hash, created_at, updated_at
                ) VALUES (?, ?, ?, 1, 0, 0, NULL, ?, ?)
                "#,
            )
            .bind(dir.file_id)
            .bind(&dir.path)
            .bind(&dir.name)
            .bind(dir.created_at)
            .bind(dir.updated_at)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => Ok(()),
                Err(e) if MetadataError::is_unique_violation(&e) => Err(
                    MetadataError::AlreadyExists(cirrus_core::path::join(&dir.path, &dir.name)),
                ),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_file(&self, file_id: Uuid) -> MetadataResult<Option<FileRow>> {
            let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE file_id = ?")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_file_by_path(&self, path: &str, name: &str) -> MetadataResult<Option<FileRow>> {
            let row =
                sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE path = ? AND name = ?")
                    .bind(path)
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn list_directory(&self, path: &str) -> MetadataResult<Vec<FileRow>> {
            let rows = sqlx::query_as::<_, FileRow>(
                "SELECT * FROM files WHERE path = ? ORDER BY is_directory DESC, name",
            )
            .bind(path)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_file(&self, file_id: Uuid) -> MetadataResult<Vec<i64>> {
            let mut tx = self.pool.begin().await?;

            let versions = sqlx::query_scalar::<_, i64>(
                "SELECT DISTINCT version_number FROM chunk_mappings WHERE file_id = ? ORDER BY version_number",
            )
            .bind(file_id)
            .fetch_all(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM file_versions WHERE file_id = ?")
                .bind(file_id)
                .execute(&mut *tx)
                .await?;

            let deleted = sqlx::query("DELETE FROM files WHERE file_id = ?")
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
            if deleted.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("file {file_id}")));
            }

            tx.commit().await?;
            Ok(versions)
        }
    }

    #[async_trait]
    impl UploadRepo for SqliteStore {
        async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO upload_sessions (
                    session_id, target_file_id, path, name, expected_version,
                    size_bytes, chunk_size, total_parts, state, file_id,
                    content_hash, created_at, updated_at, expires_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(session.session_id)
            .bind(session.target_file_id)
            .bind(&session.path)
            .bind(&session.name)
            .bind(session.expected_version)
            .bind(session.size_bytes)
            .bind(session.chunk_size)
            .bind(session.total_parts)
            .bind(&session.state)
            .bind(session.file_id)
            .bind(&session.content_hash)
            .bind(session.created_at)
            .bind(session.updated_at)
            .bind(session.expires_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_session(&self, session_id: Uuid) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE session_id = ?",
            )
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_sessions(&self) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions ORDER BY created_at DESC, rowid DESC",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn list_parts(&self, session_id: Uuid) -> MetadataResult<Vec<UploadPartRow>> {
            let rows = sqlx::query_as::<_, UploadPartRow>(
                "SELECT * FROM upload_parts WHERE session_id = ? ORDER BY part_index",
            )
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn record_part(&self, part: &UploadPartRow) -> MetadataResult<Option<UploadPartRow>> {
            let mut tx = self.pool.begin().await?;

            // Touching the session first takes the write lock for the whole check
            let session = sqlx::query_as::<_, UploadSessionRow>(
                "UPDATE upload_sessions SET updated_at = ? WHERE session_id = ? RETURNING *",
            )
            .bind(part.received_at)
            .bind(part.session_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("upload session {}", part.session_id)))?;

            if session.session_state() != Some(SessionState::Active) {
                return Err(MetadataError::Constraint(format!(
                    "upload session {} is {}",
                    part.session_id, session.state
                )));
            }
            if session.expires_at <= part.received_at {
                return Err(MetadataError::Constraint(format!(
                    "upload session {} has expired",
                    part.session_id
                )));
            }

            let replaced = sqlx::query_as::<_, UploadPartRow>(
                "DELETE FROM upload_parts WHERE session_id = ? AND part_index = ? RETURNING *",
            )
            .bind(part.session_id)
            .bind(part.part_index)
            .fetch_optional(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO upload_parts (session_id, part_index, chunk_id, size_bytes, received_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(part.session_id)
            .bind(part.part_index)
            .bind(part.chunk_id)
            .bind(part.size_bytes)
            .bind(part.received_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(replaced)
        }

        async fn begin_complete_session(
            &self,
            session_id: Uuid,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<Option<CompletionClaim>> {
            let claimed = sqlx::query_as::<_, UploadSessionRow>(
                r#"
                UPDATE upload_sessions SET state = 'completing', updated_at = ?
                WHERE session_id = ? AND state = 'active'
                RETURNING *
                "#,
            )
            .bind(updated_at)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

            match claimed {
                Some(session) => Ok(Some(CompletionClaim::Claimed(session))),
                None => Ok(self
                    .get_session(session_id)
                    .await?
                    .map(CompletionClaim::Unavailable)),
            }
        }

        async fn update_session_state(
            &self,
            session_id: Uuid,
            state: SessionState,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            let updated = sqlx::query(
                "UPDATE upload_sessions SET state = ?, updated_at = ? WHERE session_id = ?",
            )
            .bind(state.as_str())
            .bind(updated_at)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
            if updated.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("upload session {session_id}")));
            }
            Ok(())
        }

        async fn finish_session(
            &self,
            session_id: Uuid,
            file_id: Uuid,
            content_hash: &str,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<Vec<UploadPartRow>> {
            let mut tx = self.pool.begin().await?;

            let updated = sqlx::query(
                r#"
                UPDATE upload_sessions
                SET state = 'completed', file_id = ?, content_hash = ?, updated_at = ?
                WHERE session_id = ?
                "#,
            )
            .bind(file_id)
            .bind(content_hash)
            .bind(updated_at)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("upload session {session_id}")));
            }

            let parts = sqlx::query_as::<_, UploadPartRow>(
                "DELETE FROM upload_parts WHERE session_id = ? RETURNING *",
            )
            .bind(session_id)
            .fetch_all(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(parts)
        }

        async fn list_expired_sessions(
            &self,
            now: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(
                r#"
                SELECT * FROM upload_sessions
                WHERE expires_at < ?
                ORDER BY expires_at
                LIMIT ?
                "#,
            )
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_session(&self, session_id: Uuid) -> MetadataResult<Vec<UploadPartRow>> {
            let mut tx = self.pool.begin().await?;

            let parts = sqlx::query_as::<_, UploadPartRow>(
                "DELETE FROM upload_parts WHERE session_id = ? RETURNING *",
            )
            .bind(session_id)
            .fetch_all(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM upload_sessions WHERE session_id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(parts)
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Deduplicated chunks, one row per distinct content hash
CREATE TABLE IF NOT EXISTS chunks (
    chunk_id BLOB PRIMARY KEY,
    content_hash TEXT NOT NULL UNIQUE,
    storage_key TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    stored_bytes INTEGER NOT NULL,
    compressed INTEGER NOT NULL DEFAULT 0,
    refcount INTEGER NOT NULL DEFAULT 0 CHECK (refcount >= 0),
    state TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    last_referenced_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_unreferenced ON chunks(last_referenced_at) WHERE refcount = 0;
CREATE INDEX IF NOT EXISTS idx_chunks_pending ON chunks(last_referenced_at) WHERE state = 'pending';

-- Files and directories; current_version is the only mutable pointer
CREATE TABLE IF NOT EXISTS files (
    file_id BLOB PRIMARY KEY,
    path TEXT NOT NULL,
    name TEXT NOT NULL,
    is_directory INTEGER NOT NULL DEFAULT 0,
    current_version INTEGER NOT NULL DEFAULT 0,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    content_hash TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (path, name)
);

-- Append-only version history
CREATE TABLE IF NOT EXISTS file_versions (
    file_id BLOB NOT NULL,
    version_number INTEGER NOT NULL CHECK (version_number > 0),
    storage_marker TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    chunk_count INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (file_id, version_number)
);
CREATE INDEX IF NOT EXISTS idx_file_versions_hash ON file_versions(content_hash);

-- Ordered chunk list of each file version
CREATE TABLE IF NOT EXISTS chunk_mappings (
    file_id BLOB NOT NULL,
    version_number INTEGER NOT NULL,
    sequence_number INTEGER NOT NULL,
    chunk_id BLOB NOT NULL REFERENCES chunks(chunk_id),
    offset_in_file INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (file_id, version_number, sequence_number)
);
CREATE INDEX IF NOT EXISTS idx_chunk_mappings_chunk ON chunk_mappings(chunk_id);

-- Resumable uploads; each received part holds one reference on its chunk
CREATE TABLE IF NOT EXISTS upload_sessions (
    session_id BLOB PRIMARY KEY,
    target_file_id BLOB,
    path TEXT NOT NULL,
    name TEXT NOT NULL,
    expected_version INTEGER,
    size_bytes INTEGER NOT NULL CHECK (size_bytes > 0),
    chunk_size INTEGER NOT NULL,
    total_parts INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'active',
    file_id BLOB,
    content_hash TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_expires ON upload_sessions(expires_at);

CREATE TABLE IF NOT EXISTS upload_parts (
    session_id BLOB NOT NULL REFERENCES upload_sessions(session_id),
    part_index INTEGER NOT NULL,
    chunk_id BLOB NOT NULL REFERENCES chunks(chunk_id),
    size_bytes INTEGER NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (session_id, part_index)
);
CREATE INDEX IF NOT EXISTS idx_upload_parts_chunk ON upload_parts(chunk_id);
"#;
