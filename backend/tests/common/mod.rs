//! Shared fixtures for backup-keeper integration tests.
//!
//! Each test gets its own temporary directory holding an SQLite "application
//! database", a managed storage tree, a scratch root and a local destination
//! root, plus an in-memory record store.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use backup_keeper::config::{Config, DatabaseConfig};
use backup_keeper::models::provider::{BackupProvider, DriverKind, NewProvider};
use backup_keeper::services::destination::BackupDestination;
use backup_keeper::services::destination_factory;
use backup_keeper::services::dump_writer::DumpOptions;
use backup_keeper::services::record_store::{MemoryRecordStore, RecordStore};
use chrono::{DateTime, Utc};
use tempfile::TempDir;

pub struct TestEnv {
    pub dir: TempDir,
    pub config: Arc<Config>,
    pub records: Arc<MemoryRecordStore>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Scratch and local backup roots live inside the storage tree.
    pub fn with_nested_paths() -> Self {
        Self::build(true)
    }

    fn build(nested: bool) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();

        let database_file = root.join("app.sqlite");
        std::fs::write(&database_file, b"sqlite-v1").expect("write database");

        let storage = root.join("storage/app");
        std::fs::create_dir_all(storage.join("public/avatars")).expect("storage tree");
        std::fs::write(storage.join("public/avatars/1.png"), b"png").expect("write file");
        std::fs::write(storage.join("notes.txt"), b"hello").expect("write file");

        let (scratch_path, local_backup_root) = if nested {
            (storage.join("scratch"), storage.join("keeper"))
        } else {
            (root.join("scratch"), root.join("remote"))
        };

        let config = Config {
            database: DatabaseConfig {
                connection: "sqlite".into(),
                driver: "sqlite".into(),
                database: database_file.display().to_string(),
                ..Default::default()
            },
            records_database_url: None,
            app_key: "base64:dGVzdC1rZXk=".into(),
            app_url: "https://panel.test".into(),
            storage_path: storage,
            scratch_path,
            local_backup_root,
            default_retention_days: 7,
            dump: DumpOptions::default(),
            otel_endpoint: None,
        };

        Self {
            dir,
            config: Arc::new(config),
            records: Arc::new(MemoryRecordStore::new()),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn records(&self) -> Arc<dyn RecordStore> {
        self.records.clone()
    }

    pub fn database_file(&self) -> PathBuf {
        PathBuf::from(&self.config.database.database)
    }

    /// Directory the default local provider writes artifacts to
    pub fn remote_backups(&self) -> PathBuf {
        self.config.local_backup_root.join("backups")
    }

    pub async fn add_local_provider(&self, name: &str, retention_days: i32) -> BackupProvider {
        self.records
            .create_provider(NewProvider {
                name: name.into(),
                driver: DriverKind::Local,
                configuration: Default::default(),
                enabled: true,
                frequency_hours: 24,
                retention_days,
            })
            .await
            .expect("create provider")
    }

    pub fn destination(&self, provider: &BackupProvider) -> BackupDestination {
        destination_factory::destination_for(provider, &self.config).expect("destination")
    }

    /// Place a stored artifact directly on the local destination.
    pub fn seed_artifact(&self, identifier: &str, created_at: DateTime<Utc>) {
        let dir = self.remote_backups();
        std::fs::create_dir_all(&dir).expect("remote dir");
        std::fs::write(dir.join(format!("{}.zip", identifier)), b"PK-not-really").expect("zip");
        let metadata = serde_json::json!({
            "uuid": identifier,
            "type": "full",
            "created_at": created_at.to_rfc3339(),
            "filename": format!("backup-{}.zip", identifier),
        });
        std::fs::write(
            dir.join(format!("{}.json", identifier)),
            serde_json::to_vec_pretty(&metadata).expect("json"),
        )
        .expect("metadata");
    }

    pub fn scratch_is_empty(&self) -> bool {
        match std::fs::read_dir(&self.config.scratch_path) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }
}

/// Names of the entries inside a zip archive.
pub fn zip_entries(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).expect("open zip");
    let mut archive = zip::ZipArchive::new(file).expect("read zip");
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).expect("entry").name().to_string())
        .collect();
    names.sort();
    names
}
