//! Filesystem storage backend.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{ensure_parent, join_key, normalize_dir, validate_key, StorageBackend};
use crate::error::{AppError, Result};

/// Filesystem-based storage backend
pub struct FilesystemStorage {
    base_path: PathBuf,
}

impl FilesystemStorage {
    /// Create new filesystem storage
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.base_path.join(key))
    }
}

fn not_found(key: &str, e: std::io::Error) -> AppError {
    if e.kind() == std::io::ErrorKind::NotFound {
        AppError::NotFound(format!("Storage key not found: {}", key))
    } else {
        AppError::Destination(format!("Failed to read {}: {}", key, e))
    }
}

#[async_trait]
impl StorageBackend for FilesystemStorage {
    fn name(&self) -> &str {
        "local"
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<()> {
        let path = self.key_to_path(key)?;
        ensure_parent(&path).await?;

        let mut file = fs::File::create(&path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;

        Ok(())
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        let path = self.key_to_path(key)?;
        ensure_parent(&path).await?;
        fs::copy(source, &path)
            .await
            .map_err(|e| AppError::Destination(format!("Failed to write {}: {}", key, e)))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.key_to_path(key)?;
        let content = fs::read(&path).await.map_err(|e| not_found(key, e))?;
        Ok(Bytes::from(content))
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<()> {
        let path = self.key_to_path(key)?;
        ensure_parent(dest).await?;
        fs::copy(&path, dest).await.map_err(|e| not_found(key, e))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.key_to_path(key)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let path = self.key_to_path(key)?;
        let meta = fs::metadata(&path).await.map_err(|e| not_found(key, e))?;
        Ok(meta.len())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = normalize_dir(prefix);
        let path = if dir.is_empty() {
            self.base_path.clone()
        } else {
            self.key_to_path(dir)?
        };

        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(AppError::Destination(format!(
                    "Failed to list {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                keys.push(join_key(dir, &entry.file_name().to_string_lossy()));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Destination(format!(
                "Failed to delete {}: {}",
                key, e
            ))),
        }
    }
}
