//! Restore orchestration.
//!
//! The artifact is downloaded and unpacked into a scratch directory that is
//! removed when the restore ends, successful or not.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::services::archive;
use crate::services::backup_service::{DATABASE_FILE, STORAGE_FILE};
use crate::services::destination::BackupDestination;
use crate::services::destination_factory;
use crate::services::import_service::ImportService;
use crate::services::record_store::RecordStore;

/// Which sections of an artifact to restore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreScope {
    /// `database.sql` must be present
    Database,
    /// `storage.zip` must be present; replaces the live storage tree
    Storage,
    /// Whatever sections are present
    All,
}

impl RestoreScope {
    fn touches_storage(&self) -> bool {
        matches!(self, RestoreScope::Storage | RestoreScope::All)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub identifier: String,
    pub database_restored: bool,
    pub storage_restored: bool,
}

pub struct RestoreService {
    config: Arc<Config>,
    records: Arc<dyn RecordStore>,
}

impl RestoreService {
    pub fn new(config: Arc<Config>, records: Arc<dyn RecordStore>) -> Self {
        Self { config, records }
    }

    pub async fn restore_database(&self, identifier: &str) -> Result<RestoreReport> {
        self.restore(identifier, RestoreScope::Database, false).await
    }

    /// Replace the live storage tree. `confirmed` must be set by the caller.
    pub async fn restore_storage(&self, identifier: &str, confirmed: bool) -> Result<RestoreReport> {
        self.restore(identifier, RestoreScope::Storage, confirmed).await
    }

    pub async fn restore_all(&self, identifier: &str, confirmed: bool) -> Result<RestoreReport> {
        self.restore(identifier, RestoreScope::All, confirmed).await
    }

    /// Locate the artifact across providers, then restore `scope` from it.
    pub async fn restore(
        &self,
        identifier: &str,
        scope: RestoreScope,
        confirmed: bool,
    ) -> Result<RestoreReport> {
        require_confirmation(scope, confirmed)?;
        let (provider, destination) =
            destination_factory::require(self.records.as_ref(), &self.config, identifier).await?;
        tracing::info!(
            provider = %provider.name,
            identifier = %identifier,
            scope = ?scope,
            "Restoring backup"
        );
        self.restore_from(&destination, identifier, scope, confirmed)
            .await
    }

    /// Restore `scope` from an artifact on a known destination.
    pub async fn restore_from(
        &self,
        destination: &BackupDestination,
        identifier: &str,
        scope: RestoreScope,
        confirmed: bool,
    ) -> Result<RestoreReport> {
        require_confirmation(scope, confirmed)?;

        tokio::fs::create_dir_all(&self.config.scratch_path).await?;
        let workspace = tempfile::Builder::new()
            .prefix("restore-")
            .tempdir_in(&self.config.scratch_path)?;
        let archive_path = workspace.path().join("backup.zip");
        let extracted = workspace.path().join("extracted");

        destination.download(identifier, &archive_path).await?;
        archive::extract_zip_async(archive_path, extracted.clone()).await?;

        let sql = extracted.join(DATABASE_FILE);
        let storage = extracted.join(STORAGE_FILE);
        let has_sql = tokio::fs::try_exists(&sql).await.unwrap_or(false);
        let has_storage = tokio::fs::try_exists(&storage).await.unwrap_or(false);

        match scope {
            RestoreScope::Database if !has_sql => {
                return Err(AppError::missing_artifact(DATABASE_FILE))
            }
            RestoreScope::Storage if !has_storage => {
                return Err(AppError::missing_artifact(STORAGE_FILE))
            }
            _ => {}
        }

        let mut report = RestoreReport {
            identifier: identifier.to_string(),
            ..Default::default()
        };

        if has_sql && matches!(scope, RestoreScope::Database | RestoreScope::All) {
            ImportService::new(self.config.database.clone())
                .import(&sql)
                .await?;
            report.database_restored = true;
        }

        if has_storage && scope.touches_storage() {
            let unpacked = workspace.path().join("storage_extract");
            archive::extract_zip_async(storage, unpacked.clone()).await?;
            replace_tree(
                unpacked,
                self.config.storage_path.clone(),
                self.config.storage_excludes(),
            )
            .await?;
            report.storage_restored = true;
        }

        tracing::info!(
            identifier = %identifier,
            database = report.database_restored,
            storage = report.storage_restored,
            "Restore finished"
        );
        Ok(report)
    }
}

fn require_confirmation(scope: RestoreScope, confirmed: bool) -> Result<()> {
    if scope.touches_storage() && !confirmed {
        return Err(AppError::InvalidRequest(
            "Restoring storage deletes and replaces the live storage tree; confirmation is required"
                .into(),
        ));
    }
    Ok(())
}

/// Replace the contents of `target` with `source`.
///
/// Paths under `target` listed in `keep` are left in place along with the
/// directories leading to them; everything else is deleted before the copy.
/// Not atomic: an interruption after the delete leaves `target` partial.
pub async fn replace_tree(source: PathBuf, target: PathBuf, keep: Vec<PathBuf>) -> Result<usize> {
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&target)?;
        let root = target.canonicalize()?;
        let keep: Vec<PathBuf> = keep
            .iter()
            .filter_map(|path| path.canonicalize().ok())
            .filter(|path| path.starts_with(&root) && path != &root)
            .collect();
        clear_dir(&root, &keep)?;
        copy_tree(&source, &root, &keep)
    })
    .await?
}

fn clear_dir(dir: &Path, keep: &[PathBuf]) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if keep.iter().any(|kept| kept == &path) {
            continue;
        }
        if keep.iter().any(|kept| kept.starts_with(&path)) {
            clear_dir(&path, keep)?;
            continue;
        }
        if std::fs::symlink_metadata(&path)?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn copy_tree(source: &Path, target: &Path, keep: &[PathBuf]) -> Result<usize> {
    let mut copied = 0;
    let walker = WalkDir::new(source).min_depth(1).into_iter().filter_entry(|entry| {
        let dest = entry
            .path()
            .strip_prefix(source)
            .map(|relative| target.join(relative));
        !matches!(dest, Ok(dest) if keep.iter().any(|kept| dest.starts_with(kept)))
    });
    for entry in walker {
        let entry = entry.map_err(|e| AppError::Io(std::io::Error::other(e)))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| AppError::Io(std::io::Error::other(e)))?;
        let dest = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_rules() {
        assert!(require_confirmation(RestoreScope::Database, false).is_ok());
        assert!(matches!(
            require_confirmation(RestoreScope::Storage, false),
            Err(AppError::InvalidRequest(_))
        ));
        assert!(require_confirmation(RestoreScope::All, true).is_ok());
    }

    #[tokio::test]
    async fn test_replace_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        let target = tmp.path().join("target");
        std::fs::create_dir_all(source.join("public/empty")).unwrap();
        std::fs::write(source.join("public/a.txt"), b"a").unwrap();
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("stale.txt"), b"old").unwrap();

        let copied = replace_tree(source, target.clone(), Vec::new()).await.unwrap();
        assert_eq!(copied, 1);
        assert!(!target.join("stale.txt").exists());
        assert_eq!(std::fs::read(target.join("public/a.txt")).unwrap(), b"a");
        assert!(target.join("public/empty").is_dir());
    }

    #[tokio::test]
    async fn test_replace_tree_creates_missing_target() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("f"), b"1").unwrap();

        replace_tree(source, tmp.path().join("new/target"), Vec::new())
            .await
            .unwrap();
        assert!(tmp.path().join("new/target/f").is_file());
    }

    #[tokio::test]
    async fn test_replace_tree_keeps_listed_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        let target = tmp.path().join("target");
        std::fs::create_dir_all(source.join("public")).unwrap();
        std::fs::write(source.join("public/a.txt"), b"a").unwrap();
        std::fs::create_dir_all(target.join("work/restore-1")).unwrap();
        std::fs::write(target.join("work/restore-1/backup.zip"), b"zip").unwrap();
        std::fs::create_dir_all(target.join("framework/backups")).unwrap();
        std::fs::write(target.join("framework/backups/keep.zip"), b"k").unwrap();
        std::fs::write(target.join("framework/stale.txt"), b"old").unwrap();
        std::fs::write(target.join("stale.txt"), b"old").unwrap();

        let keep = vec![
            target.join("work"),
            target.join("framework/backups"),
            tmp.path().join("elsewhere"),
        ];
        replace_tree(source, target.clone(), keep).await.unwrap();

        assert_eq!(std::fs::read(target.join("work/restore-1/backup.zip")).unwrap(), b"zip");
        assert_eq!(std::fs::read(target.join("framework/backups/keep.zip")).unwrap(), b"k");
        assert!(!target.join("framework/stale.txt").exists());
        assert!(!target.join("stale.txt").exists());
        assert_eq!(std::fs::read(target.join("public/a.txt")).unwrap(), b"a");
    }
}
