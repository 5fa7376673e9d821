//! Resolve a provider record into a ready destination.
//!
//! All driver configuration is validated here, before any I/O happens.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::backup::BackupDescriptor;
use crate::models::provider::{BackupProvider, DriverKind};
use crate::services::destination::BackupDestination;
use crate::services::record_store::RecordStore;
use crate::storage::filesystem::FilesystemStorage;
use crate::storage::gdrive::{DriveBackend, DriveConfig};
use crate::storage::s3::{S3Backend, S3Config};
use crate::storage::{DriverSettings, StorageBackend};

/// Directory under the transport root artifacts are stored in by default
pub const DEFAULT_BASE_PATH: &str = "backups";

#[cfg_attr(all(feature = "ftp", feature = "sftp"), allow(dead_code))]
fn missing_client(driver: &str, feature: &str) -> AppError {
    AppError::Config(format!(
        "The {} backup driver requires the '{}' feature. Rebuild backup-keeper with --features {}",
        driver, feature, feature
    ))
}

/// Build the transport for a provider.
pub fn backend_for(provider: &BackupProvider, config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let settings = DriverSettings::new(provider.driver.as_str(), &provider.configuration);

    let backend: Arc<dyn StorageBackend> = match provider.driver {
        DriverKind::Local => {
            let root = settings
                .str("root")
                .map(PathBuf::from)
                .unwrap_or_else(|| config.local_backup_root.clone());
            Arc::new(FilesystemStorage::new(root))
        }
        #[cfg(feature = "ftp")]
        DriverKind::Ftp => {
            use crate::storage::ftp::{FtpBackend, FtpConfig};
            Arc::new(FtpBackend::new(FtpConfig::from_settings(&settings)?))
        }
        #[cfg(not(feature = "ftp"))]
        DriverKind::Ftp => return Err(missing_client("ftp", "ftp")),
        #[cfg(feature = "sftp")]
        DriverKind::Sftp => {
            use crate::storage::sftp::{SftpBackend, SftpConfig};
            Arc::new(SftpBackend::new(SftpConfig::from_settings(&settings)?))
        }
        #[cfg(not(feature = "sftp"))]
        DriverKind::Sftp => return Err(missing_client("sftp", "sftp")),
        DriverKind::ObjectStore => Arc::new(S3Backend::new(S3Config::from_settings(&settings)?)?),
        DriverKind::CloudDrive => {
            Arc::new(DriveBackend::new(DriveConfig::from_settings(&settings)?)?)
        }
    };

    Ok(backend)
}

/// Build the destination for a provider.
pub fn destination_for(provider: &BackupProvider, config: &Config) -> Result<BackupDestination> {
    let backend = backend_for(provider, config)?;
    // An explicit empty base path means the transport root
    let base_path = match provider.configuration.get("base_path").and_then(Value::as_str) {
        Some(path) => path.trim().to_string(),
        None => DEFAULT_BASE_PATH.to_string(),
    };

    tracing::debug!(
        provider = %provider.name,
        driver = %provider.driver,
        base_path = %base_path,
        "Resolved backup destination"
    );
    Ok(BackupDestination::new(backend, provider.name.clone(), &base_path))
}

/// Find the provider and destination holding an artifact.
///
/// The run log is consulted first; otherwise every enabled provider is probed
/// in order. Providers whose destination cannot be built or listed are
/// skipped during probing.
pub async fn locate(
    records: &dyn RecordStore,
    config: &Config,
    identifier: &str,
) -> Result<Option<(BackupProvider, BackupDestination)>> {
    if let Some(log) = records.find_run_by_identifier(identifier).await? {
        match records.get_provider(log.provider_id).await {
            Ok(provider) => {
                let destination = destination_for(&provider, config)?;
                return Ok(Some((provider, destination)));
            }
            Err(AppError::NotFound(_)) => {
                tracing::debug!(identifier = %identifier, "Run log references a deleted provider");
            }
            Err(e) => return Err(e),
        }
    }

    for provider in records.list_providers(true).await? {
        let destination = match destination_for(&provider, config) {
            Ok(destination) => destination,
            Err(e) => {
                tracing::warn!(provider = %provider.name, "Skipping provider while locating backup: {}", e);
                continue;
            }
        };
        match destination.get(identifier).await {
            Ok(Some(_)) => return Ok(Some((provider, destination))),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(provider = %provider.name, "Could not list backups while locating: {}", e);
            }
        }
    }

    Ok(None)
}

/// Descriptors across enabled providers (or just `provider_id`), newest first.
///
/// A provider that cannot be reached is logged and left out.
pub async fn list_backups(
    records: &dyn RecordStore,
    config: &Config,
    provider_id: Option<i64>,
) -> Result<Vec<BackupDescriptor>> {
    let providers = match provider_id {
        Some(id) => vec![records.get_provider(id).await?],
        None => records.list_providers(true).await?,
    };

    let mut backups = Vec::new();
    for provider in &providers {
        let listed = match destination_for(provider, config) {
            Ok(destination) => destination.list().await,
            Err(e) => Err(e),
        };
        match listed {
            Ok(found) => backups.extend(found),
            Err(e) => {
                tracing::warn!(provider = %provider.name, "Failed to list backups: {}", e);
            }
        }
    }

    backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(backups)
}

/// Like [`locate`], failing with `ArtifactNotFound` when nothing holds the artifact.
pub async fn require(
    records: &dyn RecordStore,
    config: &Config,
    identifier: &str,
) -> Result<(BackupProvider, BackupDestination)> {
    locate(records, config, identifier).await?.ok_or_else(|| {
        AppError::ArtifactNotFound(format!(
            "Backup destination not found for identifier: {}",
            identifier
        ))
    })
}
