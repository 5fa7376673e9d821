//! Backup orchestration.
//!
//! One run exports the database, archives the storage tree, writes the
//! metadata descriptor, hands the scratch directory to the destination and
//! prunes expired artifacts, strictly in that order. The scratch directory is
//! removed whatever the outcome.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::backup::{
    default_filename, iso8601, BackupDescriptor, BackupKind, BackupMetadata, BackupResult,
};
use crate::services::archive;
use crate::services::destination::{BackupDestination, METADATA_FILE};
use crate::services::dump_service::DumpService;
use crate::services::record_store::{RecordStore, SETTING_LAST_RUN};

pub const DATABASE_FILE: &str = "database.sql";
pub const STORAGE_FILE: &str = "storage.zip";

/// What a single run should contain
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub include_database: bool,
    pub include_storage: bool,
    /// Falls back to the configured default when `None`
    pub retention_days: Option<i64>,
    /// Operator-triggered runs do not record the last scheduled backup time
    pub manual: bool,
}

impl BackupRequest {
    /// Full backup as taken by the scheduler
    pub fn scheduled(retention_days: i64) -> Self {
        Self {
            include_database: true,
            include_storage: true,
            retention_days: Some(retention_days),
            manual: false,
        }
    }

    pub fn manual(include_database: bool, include_storage: bool, retention_days: i64) -> Self {
        Self {
            include_database,
            include_storage,
            retention_days: Some(retention_days),
            manual: true,
        }
    }
}

/// Artifacts strictly older than `now - days`. Nothing expires when `days <= 0`.
pub fn expired_backups(
    backups: &[BackupDescriptor],
    now: DateTime<Utc>,
    days: i64,
) -> Vec<&BackupDescriptor> {
    if days <= 0 {
        return Vec::new();
    }
    let limit = now - Duration::days(days);
    backups.iter().filter(|b| b.created_at < limit).collect()
}

pub struct BackupService {
    config: Arc<Config>,
    records: Arc<dyn RecordStore>,
}

impl BackupService {
    pub fn new(config: Arc<Config>, records: Arc<dyn RecordStore>) -> Self {
        Self { config, records }
    }

    /// Produce, store and prune one backup on `destination`.
    pub async fn run_backup(
        &self,
        destination: &BackupDestination,
        request: &BackupRequest,
    ) -> Result<BackupResult> {
        let kind = BackupKind::from_sections(request.include_database, request.include_storage)
            .ok_or_else(|| {
                AppError::InvalidRequest(
                    "At least one backup section (database or storage) must be selected.".into(),
                )
            })?;

        let identifier = Uuid::new_v4().to_string();
        let scratch = self.config.scratch_path.join(&identifier);
        tokio::fs::create_dir_all(&scratch).await?;

        tracing::info!(
            provider = %destination.provider_name(),
            identifier = %identifier,
            kind = %kind,
            "Starting backup run"
        );

        let packaged = self
            .package_and_store(destination, &scratch, &identifier, kind, request)
            .await;
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            tracing::warn!(path = %scratch.display(), "Failed to remove scratch directory: {}", e);
        }
        let metadata = packaged?;

        let created_at = DateTime::parse_from_rfc3339(&metadata.created_at)
            .map(|at| at.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let days = request
            .retention_days
            .unwrap_or(self.config.default_retention_days);
        self.apply_retention(destination, days).await?;

        if !request.manual {
            let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
            self.records.put_setting(SETTING_LAST_RUN, &stamp).await?;
        }

        let size_bytes = match destination.get(&metadata.uuid).await {
            Ok(found) => found.map(|d| d.size),
            Err(e) => {
                tracing::debug!(identifier = %metadata.uuid, "Could not read stored size: {}", e);
                None
            }
        };

        let metadata_map = match serde_json::to_value(&metadata)? {
            serde_json::Value::Object(map) => map,
            _ => Default::default(),
        };

        tracing::info!(
            provider = %destination.provider_name(),
            identifier = %metadata.uuid,
            size_bytes = ?size_bytes,
            "Backup run finished"
        );

        Ok(BackupResult {
            identifier: metadata.uuid,
            kind,
            includes_database: request.include_database,
            includes_storage: request.include_storage,
            created_at,
            size_bytes,
            metadata: metadata_map,
        })
    }

    async fn package_and_store(
        &self,
        destination: &BackupDestination,
        scratch: &Path,
        identifier: &str,
        kind: BackupKind,
        request: &BackupRequest,
    ) -> Result<BackupMetadata> {
        if request.include_database {
            tracing::info!(stage = "exporting", identifier = %identifier, "Dumping database");
            DumpService::new(self.config.database.clone(), self.config.dump.clone())
                .dump_to(&scratch.join(DATABASE_FILE))
                .await?;
        }

        if request.include_storage {
            tracing::info!(stage = "archiving", identifier = %identifier, "Archiving storage tree");
            let entries = archive::zip_directory_async(
                self.config.storage_path.clone(),
                scratch.join(STORAGE_FILE),
                self.config.storage_excludes(),
            )
            .await?;
            tracing::debug!(entries, "Storage archive written");
        }

        tracing::info!(stage = "packaging", identifier = %identifier, "Writing backup metadata");
        let mut metadata = BackupMetadata {
            uuid: identifier.to_string(),
            kind,
            created_at: iso8601(Utc::now().trunc_subsecs(0)),
            app_key: self.config.app_key.clone(),
            app_url: self.config.app_url.clone(),
            includes_database: request.include_database,
            includes_storage: request.include_storage,
            database_connection: self.config.database.connection.clone(),
            filename: default_filename(identifier),
            provider: None,
            disk: None,
            extra: Default::default(),
        };
        tokio::fs::write(
            scratch.join(METADATA_FILE),
            serde_json::to_vec_pretty(&metadata)?,
        )
        .await?;

        tracing::info!(stage = "uploading", identifier = %identifier, "Storing backup");
        let stored = destination.store(scratch).await?;
        metadata.uuid = stored;
        metadata.provider = Some(destination.provider_name().to_string());
        metadata.disk = Some(destination.disk().to_string());
        Ok(metadata)
    }

    /// Delete every artifact older than `days`. Returns the deleted identifiers.
    pub async fn apply_retention(
        &self,
        destination: &BackupDestination,
        days: i64,
    ) -> Result<Vec<String>> {
        if days <= 0 {
            return Ok(Vec::new());
        }

        tracing::info!(stage = "pruning", provider = %destination.provider_name(), days, "Applying retention");
        let backups = destination.list().await?;
        let mut deleted = Vec::new();
        for backup in expired_backups(&backups, Utc::now(), days) {
            destination.delete(&backup.identifier).await?;
            tracing::info!(
                provider = %destination.provider_name(),
                identifier = %backup.identifier,
                created_at = %backup.created_at,
                "Pruned expired backup"
            );
            deleted.push(backup.identifier.clone());
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn descriptor(identifier: &str, created_at: DateTime<Utc>) -> BackupDescriptor {
        BackupDescriptor {
            identifier: identifier.into(),
            filename: default_filename(identifier),
            created_at,
            kind: BackupKind::Full,
            size: 1,
            provider: "p".into(),
            disk: "local".into(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_expired_backups_strictly_older() {
        let now = Utc::now();
        let backups = vec![
            descriptor("ten", now - Duration::days(10)),
            descriptor("eight", now - Duration::days(8)),
            descriptor("one", now - Duration::days(1)),
            descriptor("edge", now - Duration::days(7)),
        ];
        let expired: Vec<&str> = expired_backups(&backups, now, 7)
            .into_iter()
            .map(|b| b.identifier.as_str())
            .collect();
        assert_eq!(expired, vec!["ten", "eight"]);
    }

    #[test]
    fn test_non_positive_retention_keeps_everything() {
        let now = Utc::now();
        let backups = vec![descriptor("ancient", now - Duration::days(400))];
        assert!(expired_backups(&backups, now, 0).is_empty());
        assert!(expired_backups(&backups, now, -3).is_empty());
    }

    #[test]
    fn test_request_constructors() {
        let scheduled = BackupRequest::scheduled(14);
        assert!(scheduled.include_database && scheduled.include_storage);
        assert!(!scheduled.manual);
        let manual = BackupRequest::manual(true, false, 3);
        assert!(manual.manual);
        assert_eq!(manual.retention_days, Some(3));
    }
}
