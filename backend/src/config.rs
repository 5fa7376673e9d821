//! Application configuration loaded from environment variables.

use std::env;
use std::fmt;
use std::path::PathBuf;

use crate::error::{AppError, Result};
use crate::services::dump_writer::DumpOptions;

/// Connection profile of the live application database (the one being backed up).
#[derive(Clone, Default)]
pub struct DatabaseConfig {
    /// Connection name, stamped into backup metadata as `database_connection`
    pub connection: String,
    /// Engine driver: mysql, mariadb, pgsql, sqlite
    pub driver: String,
    pub host: String,
    pub port: Option<u16>,
    /// Database name, or the database file path for sqlite
    pub database: String,
    pub username: String,
    pub password: Option<String>,
    pub unix_socket: Option<String>,
}

impl DatabaseConfig {
    /// Port, falling back to the engine default
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(match self.driver.as_str() {
            "pgsql" | "postgres" => 5432,
            _ => 3306,
        })
    }

    pub fn is_mysql(&self) -> bool {
        matches!(self.driver.as_str(), "mysql" | "mariadb")
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("connection", &self.connection)
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("unix_socket", &self.unix_socket)
            .finish()
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Live application database
    pub database: DatabaseConfig,

    /// Record store URL (providers, run log, settings). Unset means the
    /// application database when it is MySQL.
    pub records_database_url: Option<String>,

    /// Application key; encrypts provider configuration and is stamped into metadata
    pub app_key: String,

    /// Application URL stamped into metadata
    pub app_url: String,

    /// Managed file-storage tree
    pub storage_path: PathBuf,

    /// Root for per-run scratch directories
    pub scratch_path: PathBuf,

    /// Default root for `local` providers
    pub local_backup_root: PathBuf,

    /// Retention used when a run does not pass one
    pub default_retention_days: i64,

    /// SQL dump options
    pub dump: DumpOptions,

    /// OTLP endpoint for span export (optional)
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let connection = env::var("DB_CONNECTION").unwrap_or_else(|_| "mysql".into());
        let driver = env::var("DB_DRIVER").unwrap_or_else(|_| connection.clone());
        let port = match env::var("DB_PORT") {
            Ok(raw) => Some(
                raw.parse()
                    .map_err(|_| AppError::Config(format!("DB_PORT is not a port: {}", raw)))?,
            ),
            Err(_) => None,
        };

        let database = DatabaseConfig {
            connection,
            driver,
            host: env::var("DB_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port,
            database: env::var("DB_DATABASE")
                .map_err(|_| AppError::Config("DB_DATABASE not set".into()))?,
            username: env::var("DB_USERNAME").unwrap_or_else(|_| "root".into()),
            password: env::var("DB_PASSWORD").ok(),
            unix_socket: env::var("DB_SOCKET").ok().filter(|s| !s.is_empty()),
        };

        let records_database_url = env::var("BACKUP_RECORDS_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let mut dump = DumpOptions::default();
        if let Ok(list) = env::var("BACKUP_EXCLUDE_TABLES") {
            dump.exclude_tables = split_list(&list);
        }
        if let Ok(list) = env::var("BACKUP_INCLUDE_TABLES") {
            dump.include_tables = split_list(&list);
        }
        if let Some(length) = env::var("BACKUP_NET_BUFFER_LENGTH")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            dump.net_buffer_length = length;
        }

        Ok(Self {
            database,
            records_database_url,
            app_key: env::var("APP_KEY").unwrap_or_default(),
            app_url: env::var("APP_URL").unwrap_or_else(|_| "http://localhost".into()),
            storage_path: env::var("STORAGE_PATH")
                .unwrap_or_else(|_| "storage/app".into())
                .into(),
            scratch_path: env::var("BACKUP_SCRATCH_PATH")
                .unwrap_or_else(|_| "storage/framework/backup".into())
                .into(),
            local_backup_root: env::var("BACKUP_LOCAL_ROOT")
                .unwrap_or_else(|_| "storage/backups".into())
                .into(),
            default_retention_days: env::var("BACKUP_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(7),
            dump,
            otel_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        })
    }

    /// The backups area inside the storage tree, never archived into itself.
    pub fn storage_backups_path(&self) -> PathBuf {
        self.storage_path.join("backups")
    }

    /// Paths that may sit inside the storage tree but belong to the keeper:
    /// the backups area, the scratch root and the local backup root. They are
    /// never archived and survive a storage restore.
    pub fn storage_excludes(&self) -> Vec<PathBuf> {
        vec![
            self.storage_backups_path(),
            self.scratch_path.clone(),
            self.local_backup_root.clone(),
        ]
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
