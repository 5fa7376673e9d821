//! Persistence of providers, run log entries and settings.
//!
//! The orchestration services only need this narrow interface. The SQL
//! implementation lives in `sql_record_store`; [`MemoryRecordStore`] backs
//! tests and embedded use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::backup::{BackupLog, RunCompletion, RunStatus};
use crate::models::provider::{BackupProvider, NewProvider};

/// Settings key holding the time of the last scheduled backup
pub const SETTING_LAST_RUN: &str = "backup_last_run";

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Providers ordered by id
    async fn list_providers(&self, enabled_only: bool) -> Result<Vec<BackupProvider>>;

    /// A provider by id, `AppError::NotFound` when absent
    async fn get_provider(&self, id: i64) -> Result<BackupProvider>;

    async fn create_provider(&self, provider: NewProvider) -> Result<BackupProvider>;

    async fn touch_last_run(&self, provider_id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Insert a `running` log entry
    async fn start_run(&self, provider_id: i64, started_at: DateTime<Utc>) -> Result<BackupLog>;

    /// Apply the terminal update to a running entry.
    ///
    /// Entries that already left `running` are not touched.
    async fn complete_run(
        &self,
        run_id: i64,
        completion: &RunCompletion,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn find_run_by_identifier(&self, identifier: &str) -> Result<Option<BackupLog>>;

    async fn delete_runs_by_identifier(&self, identifier: &str) -> Result<u64>;

    /// Newest entries first
    async fn recent_runs(&self, provider_id: Option<i64>, limit: i64) -> Result<Vec<BackupLog>>;

    /// Mark every entry still `running` that started before `started_before` as failed.
    async fn fail_stale_runs(&self, started_before: DateTime<Utc>, message: &str) -> Result<u64>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn put_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// Apply a completion to a log entry in place.
pub(crate) fn apply_completion(
    log: &mut BackupLog,
    completion: &RunCompletion,
    completed_at: DateTime<Utc>,
) {
    log.status = completion.status();
    log.completed_at = Some(completed_at);
    match completion {
        RunCompletion::Success {
            identifier,
            kind,
            size_bytes,
        } => {
            log.identifier = Some(identifier.clone());
            log.kind = Some(*kind);
            log.size_bytes = *size_bytes;
        }
        RunCompletion::Failed { error_message } => {
            log.error_message = Some(error_message.clone());
        }
    }
}

#[derive(Default)]
struct MemoryState {
    providers: Vec<BackupProvider>,
    runs: Vec<BackupLog>,
    settings: HashMap<String, String>,
    next_provider_id: i64,
    next_run_id: i64,
}

/// In-process record store
#[derive(Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| AppError::Database("record store lock poisoned".into()))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn list_providers(&self, enabled_only: bool) -> Result<Vec<BackupProvider>> {
        let state = self.lock()?;
        Ok(state
            .providers
            .iter()
            .filter(|p| !enabled_only || p.enabled)
            .cloned()
            .collect())
    }

    async fn get_provider(&self, id: i64) -> Result<BackupProvider> {
        self.lock()?
            .providers
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Backup provider {} not found", id)))
    }

    async fn create_provider(&self, provider: NewProvider) -> Result<BackupProvider> {
        provider.validate()?;
        let mut state = self.lock()?;
        state.next_provider_id += 1;
        let created = BackupProvider {
            id: state.next_provider_id,
            name: provider.name,
            driver: provider.driver,
            configuration: provider.configuration,
            enabled: provider.enabled,
            frequency_hours: provider.frequency_hours,
            retention_days: provider.retention_days,
            last_run_at: None,
        };
        state.providers.push(created.clone());
        Ok(created)
    }

    async fn touch_last_run(&self, provider_id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock()?;
        let provider = state
            .providers
            .iter_mut()
            .find(|p| p.id == provider_id)
            .ok_or_else(|| AppError::NotFound(format!("Backup provider {} not found", provider_id)))?;
        provider.last_run_at = Some(at);
        Ok(())
    }

    async fn start_run(&self, provider_id: i64, started_at: DateTime<Utc>) -> Result<BackupLog> {
        let mut state = self.lock()?;
        state.next_run_id += 1;
        let log = BackupLog {
            id: state.next_run_id,
            provider_id,
            identifier: None,
            status: RunStatus::Running,
            kind: None,
            size_bytes: None,
            error_message: None,
            started_at,
            completed_at: None,
        };
        state.runs.push(log.clone());
        Ok(log)
    }

    async fn complete_run(
        &self,
        run_id: i64,
        completion: &RunCompletion,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(log) = state
            .runs
            .iter_mut()
            .find(|r| r.id == run_id && r.status == RunStatus::Running)
        {
            apply_completion(log, completion, completed_at);
        }
        Ok(())
    }

    async fn find_run_by_identifier(&self, identifier: &str) -> Result<Option<BackupLog>> {
        Ok(self
            .lock()?
            .runs
            .iter()
            .find(|r| r.identifier.as_deref() == Some(identifier))
            .cloned())
    }

    async fn delete_runs_by_identifier(&self, identifier: &str) -> Result<u64> {
        let mut state = self.lock()?;
        let before = state.runs.len();
        state
            .runs
            .retain(|r| r.identifier.as_deref() != Some(identifier));
        Ok((before - state.runs.len()) as u64)
    }

    async fn recent_runs(&self, provider_id: Option<i64>, limit: i64) -> Result<Vec<BackupLog>> {
        let state = self.lock()?;
        let mut runs: Vec<BackupLog> = state
            .runs
            .iter()
            .filter(|r| provider_id.map_or(true, |id| r.provider_id == id))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn fail_stale_runs(&self, started_before: DateTime<Utc>, message: &str) -> Result<u64> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let completion = RunCompletion::Failed {
            error_message: message.to_string(),
        };
        let mut count = 0;
        for log in state
            .runs
            .iter_mut()
            .filter(|r| r.status == RunStatus::Running && r.started_at < started_before)
        {
            apply_completion(log, &completion, now);
            count += 1;
        }
        Ok(count)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backup::BackupKind;
    use crate::models::provider::DriverKind;
    use chrono::Duration;
    use serde_json::Map;

    fn new_provider(name: &str, enabled: bool) -> NewProvider {
        NewProvider {
            name: name.into(),
            driver: DriverKind::Local,
            configuration: Map::new(),
            enabled,
            frequency_hours: 24,
            retention_days: 7,
        }
    }

    #[tokio::test]
    async fn test_providers_enabled_filter() {
        let store = MemoryRecordStore::new();
        store.create_provider(new_provider("a", true)).await.unwrap();
        store.create_provider(new_provider("b", false)).await.unwrap();

        assert_eq!(store.list_providers(false).await.unwrap().len(), 2);
        let enabled = store.list_providers(true).await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "a");
        assert!(matches!(store.get_provider(99).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_provider_validates() {
        let store = MemoryRecordStore::new();
        let mut invalid = new_provider("x", true);
        invalid.frequency_hours = 0;
        assert!(matches!(
            store.create_provider(invalid).await,
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_run_applies_once() {
        let store = MemoryRecordStore::new();
        let now = Utc::now();
        let log = store.start_run(1, now).await.unwrap();
        assert_eq!(log.status, RunStatus::Running);

        let success = RunCompletion::Success {
            identifier: "id-1".into(),
            kind: BackupKind::Full,
            size_bytes: Some(10),
        };
        store.complete_run(log.id, &success, now).await.unwrap();
        let failure = RunCompletion::Failed {
            error_message: "late".into(),
        };
        store.complete_run(log.id, &failure, now).await.unwrap();

        let stored = store.find_run_by_identifier("id-1").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.kind, Some(BackupKind::Full));
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn test_fail_stale_runs() {
        let store = MemoryRecordStore::new();
        let now = Utc::now();
        store.start_run(1, now - Duration::hours(5)).await.unwrap();
        store.start_run(1, now).await.unwrap();

        let failed = store
            .fail_stale_runs(now - Duration::hours(1), "interrupted")
            .await
            .unwrap();
        assert_eq!(failed, 1);

        let runs = store.recent_runs(Some(1), 10).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Running);
        assert_eq!(runs[1].status, RunStatus::Failed);
        assert_eq!(runs[1].error_message.as_deref(), Some("interrupted"));
    }

    #[tokio::test]
    async fn test_delete_runs_by_identifier() {
        let store = MemoryRecordStore::new();
        let now = Utc::now();
        let log = store.start_run(1, now).await.unwrap();
        let success = RunCompletion::Success {
            identifier: "gone".into(),
            kind: BackupKind::Database,
            size_bytes: None,
        };
        store.complete_run(log.id, &success, now).await.unwrap();

        assert_eq!(store.delete_runs_by_identifier("gone").await.unwrap(), 1);
        assert!(store.find_run_by_identifier("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_settings() {
        let store = MemoryRecordStore::new();
        assert!(store.get_setting(SETTING_LAST_RUN).await.unwrap().is_none());
        store.put_setting(SETTING_LAST_RUN, "2025-01-01 00:00:00").await.unwrap();
        assert_eq!(
            store.get_setting(SETTING_LAST_RUN).await.unwrap().as_deref(),
            Some("2025-01-01 00:00:00")
        );
    }
}
