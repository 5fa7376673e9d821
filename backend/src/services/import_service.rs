//! Database import: replays a dump against the live application database.

use std::path::Path;

use crate::config::DatabaseConfig;
use crate::error::{AppError, Result};
use crate::services::db_client;

pub struct ImportService {
    database: DatabaseConfig,
}

impl ImportService {
    pub fn new(database: DatabaseConfig) -> Self {
        Self { database }
    }

    /// Replay `dump` into the configured database.
    ///
    /// Server engines get the file on the client's stdin. For SQLite the dump
    /// is the database file itself and replaces it.
    pub async fn import(&self, dump: &Path) -> Result<()> {
        if !tokio::fs::try_exists(dump).await.unwrap_or(false) {
            return Err(AppError::InvalidRequest(format!(
                "Dump file {} does not exist",
                dump.display()
            )));
        }

        tracing::info!(
            driver = %self.database.driver,
            database = %self.database.database,
            "Importing database dump"
        );

        match self.database.driver.as_str() {
            "mysql" | "mariadb" => {
                db_client::run(&db_client::mysql_import(&self.database), Some(dump)).await
            }
            "pgsql" | "postgres" => {
                db_client::run(&db_client::psql_import(&self.database), Some(dump)).await
            }
            "sqlite" => {
                tokio::fs::copy(dump, &self.database.database)
                    .await
                    .map_err(|e| {
                        AppError::Database(format!(
                            "Failed to replace SQLite database {}: {}",
                            self.database.database, e
                        ))
                    })?;
                Ok(())
            }
            other => Err(AppError::unsupported_driver(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite(path: &Path) -> DatabaseConfig {
        DatabaseConfig {
            connection: "sqlite".into(),
            driver: "sqlite".into(),
            database: path.display().to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sqlite_import_replaces_file() {
        let tmp = tempfile::tempdir().unwrap();
        let live = tmp.path().join("app.sqlite");
        let dump = tmp.path().join("database.sql");
        std::fs::write(&live, b"old").unwrap();
        std::fs::write(&dump, b"new").unwrap();

        ImportService::new(sqlite(&live)).import(&dump).await.unwrap();
        assert_eq!(std::fs::read(&live).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_unsupported_driver() {
        let tmp = tempfile::tempdir().unwrap();
        let dump = tmp.path().join("database.sql");
        std::fs::write(&dump, b"--").unwrap();
        let config = DatabaseConfig {
            driver: "sqlsrv".into(),
            ..Default::default()
        };

        let err = ImportService::new(config).import(&dump).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(err.to_string().contains("[sqlsrv]"));
    }

    #[tokio::test]
    async fn test_missing_dump_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ImportService::new(sqlite(&tmp.path().join("db")))
            .import(&tmp.path().join("absent.sql"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_sqlite_copy_failure_is_database_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dump = tmp.path().join("database.sql");
        std::fs::write(&dump, b"x").unwrap();
        let live = tmp.path().join("missing-dir/app.sqlite");

        let err = ImportService::new(sqlite(&live)).import(&dump).await.unwrap_err();
        assert!(matches!(err, AppError::Database(_)));
    }
}
