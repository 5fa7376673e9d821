//! MySQL-backed record store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Map;
use sqlx::MySqlPool;

use crate::error::{AppError, Result};
use crate::models::backup::{BackupLog, RunCompletion, RunStatus};
use crate::models::provider::{BackupProvider, NewProvider};
use crate::services::encryption::ConfigCipher;
use crate::services::record_store::RecordStore;

const PROVIDER_COLUMNS: &str = "id, name, driver, configuration, enabled, frequency_hours, \
     retention_days, last_run_at";

const LOG_COLUMNS: &str = "id, provider_id, identifier, status, type AS kind, size_bytes, \
     error_message, started_at, completed_at";

#[derive(Debug, sqlx::FromRow)]
struct ProviderRow {
    id: i64,
    name: String,
    driver: String,
    configuration: Option<String>,
    enabled: bool,
    frequency_hours: i32,
    retention_days: i32,
    last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct LogRow {
    id: i64,
    provider_id: i64,
    identifier: Option<String>,
    status: String,
    kind: Option<String>,
    size_bytes: Option<i64>,
    error_message: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<LogRow> for BackupLog {
    type Error = AppError;

    fn try_from(row: LogRow) -> Result<Self> {
        Ok(BackupLog {
            id: row.id,
            provider_id: row.provider_id,
            identifier: row.identifier,
            status: row.status.parse().map_err(AppError::Database)?,
            kind: row.kind.and_then(|k| k.parse().ok()),
            size_bytes: row.size_bytes,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// Record store on the `backup_providers`, `backup_logs` and `backup_settings` tables
pub struct SqlRecordStore {
    pool: MySqlPool,
    cipher: ConfigCipher,
}

impl SqlRecordStore {
    pub fn new(pool: MySqlPool, cipher: ConfigCipher) -> Self {
        Self { pool, cipher }
    }

    fn to_provider(&self, row: ProviderRow) -> Result<BackupProvider> {
        let configuration = match row.configuration.as_deref().map(str::trim) {
            Some(sealed) if !sealed.is_empty() => self.cipher.open_configuration(sealed)?,
            _ => Map::new(),
        };
        Ok(BackupProvider {
            id: row.id,
            name: row.name,
            driver: row.driver.parse()?,
            configuration,
            enabled: row.enabled,
            frequency_hours: row.frequency_hours,
            retention_days: row.retention_days,
            last_run_at: row.last_run_at,
        })
    }
}

#[async_trait]
impl RecordStore for SqlRecordStore {
    async fn list_providers(&self, enabled_only: bool) -> Result<Vec<BackupProvider>> {
        let sql = if enabled_only {
            format!("SELECT {} FROM backup_providers WHERE enabled = 1 ORDER BY id", PROVIDER_COLUMNS)
        } else {
            format!("SELECT {} FROM backup_providers ORDER BY id", PROVIDER_COLUMNS)
        };
        let rows = sqlx::query_as::<_, ProviderRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|row| self.to_provider(row)).collect()
    }

    async fn get_provider(&self, id: i64) -> Result<BackupProvider> {
        let sql = format!("SELECT {} FROM backup_providers WHERE id = ?", PROVIDER_COLUMNS);
        let row = sqlx::query_as::<_, ProviderRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Backup provider {} not found", id)))?;
        self.to_provider(row)
    }

    async fn create_provider(&self, provider: NewProvider) -> Result<BackupProvider> {
        provider.validate()?;
        let sealed = self.cipher.seal_configuration(&provider.configuration)?;

        let result = sqlx::query(
            r#"
            INSERT INTO backup_providers
                (name, driver, configuration, enabled, frequency_hours, retention_days)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&provider.name)
        .bind(provider.driver.as_str())
        .bind(&sealed)
        .bind(provider.enabled)
        .bind(provider.frequency_hours)
        .bind(provider.retention_days)
        .execute(&self.pool)
        .await?;

        tracing::info!(provider = %provider.name, driver = %provider.driver, "Created backup provider");
        self.get_provider(result.last_insert_id() as i64).await
    }

    async fn touch_last_run(&self, provider_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE backup_providers SET last_run_at = ? WHERE id = ?")
            .bind(at)
            .bind(provider_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn start_run(&self, provider_id: i64, started_at: DateTime<Utc>) -> Result<BackupLog> {
        let result = sqlx::query(
            "INSERT INTO backup_logs (provider_id, status, started_at) VALUES (?, ?, ?)",
        )
        .bind(provider_id)
        .bind(RunStatus::Running.as_str())
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        Ok(BackupLog {
            id: result.last_insert_id() as i64,
            provider_id,
            identifier: None,
            status: RunStatus::Running,
            kind: None,
            size_bytes: None,
            error_message: None,
            started_at,
            completed_at: None,
        })
    }

    async fn complete_run(
        &self,
        run_id: i64,
        completion: &RunCompletion,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let query = match completion {
            RunCompletion::Success {
                identifier,
                kind,
                size_bytes,
            } => sqlx::query(
                r#"
                UPDATE backup_logs
                SET status = ?, identifier = ?, type = ?, size_bytes = ?, completed_at = ?
                WHERE id = ? AND status = 'running'
                "#,
            )
            .bind(RunStatus::Success.as_str())
            .bind(identifier.as_str())
            .bind(kind.as_str())
            .bind(*size_bytes)
            .bind(completed_at)
            .bind(run_id),
            RunCompletion::Failed { error_message } => sqlx::query(
                r#"
                UPDATE backup_logs
                SET status = ?, error_message = ?, completed_at = ?
                WHERE id = ? AND status = 'running'
                "#,
            )
            .bind(RunStatus::Failed.as_str())
            .bind(error_message.as_str())
            .bind(completed_at)
            .bind(run_id),
        };

        let updated = query.execute(&self.pool).await?.rows_affected();
        if updated == 0 {
            tracing::warn!(run_id, "Run log entry was not running, terminal update ignored");
        }
        Ok(())
    }

    async fn find_run_by_identifier(&self, identifier: &str) -> Result<Option<BackupLog>> {
        let sql = format!(
            "SELECT {} FROM backup_logs WHERE identifier = ? ORDER BY id LIMIT 1",
            LOG_COLUMNS
        );
        sqlx::query_as::<_, LogRow>(&sql)
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?
            .map(BackupLog::try_from)
            .transpose()
    }

    async fn delete_runs_by_identifier(&self, identifier: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM backup_logs WHERE identifier = ?")
            .bind(identifier)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn recent_runs(&self, provider_id: Option<i64>, limit: i64) -> Result<Vec<BackupLog>> {
        let rows = match provider_id {
            Some(id) => {
                let sql = format!(
                    "SELECT {} FROM backup_logs WHERE provider_id = ? \
                     ORDER BY started_at DESC, id DESC LIMIT ?",
                    LOG_COLUMNS
                );
                sqlx::query_as::<_, LogRow>(&sql)
                    .bind(id)
                    .bind(limit.max(0))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM backup_logs ORDER BY started_at DESC, id DESC LIMIT ?",
                    LOG_COLUMNS
                );
                sqlx::query_as::<_, LogRow>(&sql)
                    .bind(limit.max(0))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(BackupLog::try_from).collect()
    }

    async fn fail_stale_runs(&self, started_before: DateTime<Utc>, message: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE backup_logs
            SET status = ?, error_message = ?, completed_at = ?
            WHERE status = 'running' AND started_at < ?
            "#,
        )
        .bind(RunStatus::Failed.as_str())
        .bind(message)
        .bind(Utc::now())
        .bind(started_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM backup_settings WHERE `key` = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.flatten())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO backup_settings (`key`, value) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE value = VALUES(value)",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backup::BackupKind;

    fn log_row(status: &str, kind: Option<&str>) -> LogRow {
        LogRow {
            id: 1,
            provider_id: 2,
            identifier: Some("abc".into()),
            status: status.into(),
            kind: kind.map(String::from),
            size_bytes: Some(10),
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_log_row_conversion() {
        let log = BackupLog::try_from(log_row("success", Some("database"))).unwrap();
        assert_eq!(log.status, RunStatus::Success);
        assert_eq!(log.kind, Some(BackupKind::Database));
    }

    #[test]
    fn test_log_row_unknown_status_is_an_error() {
        assert!(matches!(
            BackupLog::try_from(log_row("exploded", None)),
            Err(AppError::Database(_))
        ));
    }

    #[test]
    fn test_log_row_tolerates_unknown_kind() {
        let log = BackupLog::try_from(log_row("failed", Some("incremental"))).unwrap();
        assert!(log.kind.is_none());
    }
}
