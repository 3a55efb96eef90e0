//! Local filesystem blob backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{BlobStore, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Blob store rooted at a local directory.
///
/// Keys map to relative paths below the root. Writes go to a uniquely named
/// temp file that is fsynced and renamed into place, so readers see either
/// nothing or the complete blob.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend, creating the root if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolve a key to a path below the root.
    ///
    /// `canonicalize` and `symlink_metadata` block, so resolution runs on the
    /// blocking pool.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Reject keys that would escape the root, including through symlinks.
    ///
    /// The nearest existing ancestor of the target (or the target itself) must
    /// resolve inside the canonical root.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;

        let path = root.join(key);
        let root_canonical = root.canonicalize()?;

        let mut nearest = Some(path.as_path());
        while let Some(candidate) = nearest {
            match std::fs::symlink_metadata(candidate) {
                Ok(meta) => {
                    let resolved = candidate.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!("dangling symlink in key: {key}"))
                        } else {
                            StorageError::Io(e)
                        }
                    })?;
                    if !resolved.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "resolved path escapes storage root: {key}"
                        )));
                    }
                    return Ok(path);
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    nearest = candidate.parent();
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(path)
    }

    fn not_found_or_io(key: &str, e: std::io::Error) -> StorageError {
        if e.kind() == ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl BlobStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path)
            .await
            .map_err(|e| Self::not_found_or_io(key, e))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key_hint: &str, data: Bytes) -> StorageResult<String> {
        let path = self.key_path(key_hint).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Unique temp name so concurrent writers of the same key never collide
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!("{file_name}.tmp.{}", Uuid::new_v4()));

        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&temp_path).await
                && cleanup.kind() != ErrorKind::NotFound
            {
                tracing::warn!(temp = %temp_path.display(), error = %cleanup, "failed to remove temp blob");
            }
            return Err(StorageError::Io(e));
        }

        Ok(key_hint.to_string())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Self::not_found_or_io(key, e))
    }

    async fn health_check(&self) -> StorageResult<()> {
        let key = format!(".health/{}", Uuid::new_v4());
        self.put(&key, Bytes::from_static(b"ok")).await?;
        self.delete(&key).await
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_returns_hint_and_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let data = Bytes::from("hello world");
        let key = backend
            .put("chunks/ab/cd/abcd-1", data.clone())
            .await
            .unwrap();
        assert_eq!(key, "chunks/ab/cd/abcd-1");
        assert!(backend.exists(&key).await.unwrap());
        assert_eq!(backend.get(&key).await.unwrap(), data);
        assert!(dir.path().join("chunks/ab/cd/abcd-1").is_file());
    }

    #[tokio::test]
    async fn test_put_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        backend
            .put("a/blob", Bytes::from_static(b"one"))
            .await
            .unwrap();
        backend
            .put("a/blob", Bytes::from_static(b"two"))
            .await
            .unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["blob".to_string()]);
        assert_eq!(backend.get("a/blob").await.unwrap().as_ref(), b"two");
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        assert!(matches!(
            backend.get("nope").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            backend.delete("nope").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        assert!(backend.exists("../escape").await.is_err());
        assert!(backend.exists("/absolute/path").await.is_err());
        assert!(backend.exists("foo/../../etc/passwd").await.is_err());
        assert!(backend.exists("valid/nested/key").await.is_ok());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlink_escape_rejected() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();

        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        symlink(outside.path(), dir.path().join("escape")).unwrap();

        let read = backend.get("escape/secret.txt").await;
        assert!(matches!(read, Err(StorageError::InvalidKey(_))));

        let write = backend
            .put("escape/nested/deep/blob", Bytes::from_static(b"data"))
            .await;
        match write {
            Err(StorageError::InvalidKey(msg)) => assert!(msg.contains("escapes storage root")),
            other => panic!("expected InvalidKey, got {other:?}"),
        }
        assert!(!outside.path().join("nested").exists());
    }

    #[tokio::test]
    async fn test_health_check_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        backend.health_check().await.unwrap();

        let leftovers = std::fs::read_dir(dir.path().join(".health")).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
