//! Backup destination.
//!
//! An artifact is a pair of sibling objects under the destination's base
//! path: `<identifier>.zip` holding the packaged scratch directory and
//! `<identifier>.json` holding its metadata. The logic here is written once
//! and parametrized by the transport it runs on.

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::backup::{default_filename, BackupDescriptor, BackupKind};
use crate::services::archive;
use crate::storage::{join_key, key_name, normalize_dir, StorageBackend};

/// Name of the metadata file every scratch directory must contain
pub const METADATA_FILE: &str = "backup.json";

pub struct BackupDestination {
    backend: Arc<dyn StorageBackend>,
    provider_name: String,
    base_path: String,
}

impl BackupDestination {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        provider_name: impl Into<String>,
        base_path: &str,
    ) -> Self {
        Self {
            backend,
            provider_name: provider_name.into(),
            base_path: normalize_dir(base_path).to_string(),
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Transport name, stamped into metadata as `disk`
    pub fn disk(&self) -> &str {
        self.backend.name()
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    fn zip_key(&self, identifier: &str) -> Result<String> {
        Ok(join_key(
            &self.base_path,
            &format!("{}.zip", clean_identifier(identifier)?),
        ))
    }

    fn metadata_key(&self, identifier: &str) -> Result<String> {
        Ok(join_key(
            &self.base_path,
            &format!("{}.json", clean_identifier(identifier)?),
        ))
    }

    /// Package and upload a scratch directory, returning the artifact identifier.
    ///
    /// The directory must contain `backup.json`. Its `uuid` becomes the
    /// identifier (a fresh one is assigned when absent); provider, disk and a
    /// default filename are stamped into it before upload.
    pub async fn store(&self, scratch_dir: &Path) -> Result<String> {
        let metadata_path = scratch_dir.join(METADATA_FILE);
        if !tokio::fs::try_exists(&metadata_path).await.unwrap_or(false) {
            return Err(AppError::MissingArtifact(format!(
                "Backup metadata file [{}] is missing.",
                METADATA_FILE
            )));
        }

        let raw = tokio::fs::read(&metadata_path).await?;
        let mut metadata = match serde_json::from_slice::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            _ => {
                tracing::warn!(path = %metadata_path.display(), "Backup metadata is not a JSON object, starting from empty");
                Map::new()
            }
        };

        let identifier = match metadata.get("uuid").and_then(Value::as_str) {
            Some(uuid) if !uuid.trim().is_empty() => uuid.trim().to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        let zip_key = self.zip_key(&identifier)?;
        let metadata_key = self.metadata_key(&identifier)?;

        metadata.insert("uuid".into(), Value::String(identifier.clone()));
        metadata.insert("provider".into(), Value::String(self.provider_name.clone()));
        metadata.insert("disk".into(), Value::String(self.disk().to_string()));
        if !metadata.get("filename").is_some_and(Value::is_string) {
            metadata.insert("filename".into(), Value::String(default_filename(&identifier)));
        }
        let rendered = serde_json::to_vec_pretty(&metadata)?;
        tokio::fs::write(&metadata_path, &rendered).await?;

        let archive_path = sibling_archive(scratch_dir);
        let entries = archive::zip_directory_async(
            scratch_dir.to_path_buf(),
            archive_path.clone(),
            Vec::new(),
        )
        .await?;

        let uploaded = async {
            self.backend.put_file(&zip_key, &archive_path).await?;
            self.backend.put(&metadata_key, Bytes::from(rendered)).await
        }
        .await;
        if let Err(e) = tokio::fs::remove_file(&archive_path).await {
            tracing::debug!(path = %archive_path.display(), "Could not remove local archive: {}", e);
        }
        uploaded?;

        tracing::info!(
            provider = %self.provider_name,
            disk = %self.disk(),
            identifier = %identifier,
            entries,
            "Stored backup artifact"
        );
        Ok(identifier)
    }

    /// Every complete artifact, newest first.
    ///
    /// Metadata without a matching archive, or that does not parse as a JSON
    /// object, is skipped.
    pub async fn list(&self) -> Result<Vec<BackupDescriptor>> {
        let keys = self.backend.list(&self.base_path).await?;
        let mut backups = Vec::new();

        for key in keys.iter().filter(|k| k.ends_with(".json")) {
            let payload = match serde_json::from_slice::<Value>(&self.backend.get(key).await?) {
                Ok(Value::Object(map)) => map,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(key = %key, "Skipping unreadable backup metadata: {}", e);
                    continue;
                }
            };

            let identifier = match payload.get("uuid").and_then(Value::as_str) {
                Some(uuid) => uuid.trim().to_string(),
                None => key_name(key).trim_end_matches(".json").to_string(),
            };
            let Ok(zip_key) = self.zip_key(&identifier) else {
                continue;
            };
            if !self.backend.exists(&zip_key).await? {
                continue;
            }

            let created_at = payload
                .get("created_at")
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now);
            let size = self.backend.size(&zip_key).await?;
            let kind = payload
                .get("type")
                .and_then(Value::as_str)
                .and_then(|t| t.parse().ok())
                .unwrap_or(BackupKind::Full);
            let text = |field: &str| payload.get(field).and_then(Value::as_str).map(String::from);

            backups.push(BackupDescriptor {
                filename: text("filename").unwrap_or_else(|| default_filename(&identifier)),
                provider: text("provider").unwrap_or_else(|| self.provider_name.clone()),
                disk: text("disk").unwrap_or_else(|| self.disk().to_string()),
                identifier,
                created_at,
                kind,
                size,
                metadata: payload,
            });
        }

        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        Ok(backups)
    }

    pub async fn get(&self, identifier: &str) -> Result<Option<BackupDescriptor>> {
        let identifier = identifier.trim();
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|b| b.identifier == identifier))
    }

    /// Remove both halves of an artifact. Missing objects are not an error.
    pub async fn delete(&self, identifier: &str) -> Result<()> {
        self.backend.delete(&self.zip_key(identifier)?).await?;
        self.backend.delete(&self.metadata_key(identifier)?).await?;
        tracing::info!(provider = %self.provider_name, identifier = %identifier, "Deleted backup artifact");
        Ok(())
    }

    /// Fetch the archive of an artifact into `local_path`.
    pub async fn download(&self, identifier: &str, local_path: &Path) -> Result<()> {
        let zip_key = self.zip_key(identifier)?;
        if !self.backend.exists(&zip_key).await? {
            return Err(AppError::ArtifactNotFound(format!(
                "Backup archive not found for identifier {}",
                identifier
            )));
        }
        self.backend.get_to_file(&zip_key, local_path).await
    }
}

/// `<dir>.zip` next to the directory itself.
fn sibling_archive(dir: &Path) -> PathBuf {
    let mut name = OsString::from(dir.as_os_str());
    name.push(".zip");
    PathBuf::from(name)
}

fn clean_identifier(identifier: &str) -> Result<&str> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() || trimmed.contains('/') || trimmed.contains('\\') || trimmed == ".." {
        return Err(AppError::InvalidRequest(format!(
            "Invalid backup identifier: {:?}",
            identifier
        )));
    }
    Ok(trimmed)
}

/// Parse the `created_at` formats found in metadata: RFC 3339 and the plain
/// `YYYY-MM-DD HH:MM:SS` form (taken as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
