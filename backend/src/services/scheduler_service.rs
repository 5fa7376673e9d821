//! Provider scheduling and the run log lifecycle.
//!
//! Every run, scheduled or manual, is recorded as a `running` log entry that
//! receives exactly one terminal update. Providers are processed one after
//! another; a failing provider does not stop the others.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::backup::{BackupResult, RunCompletion};
use crate::models::provider::BackupProvider;
use crate::services::backup_service::{BackupRequest, BackupService};
use crate::services::destination_factory;
use crate::services::record_store::RecordStore;

/// How often the daemon checks for due providers
pub const DAEMON_PERIOD: Duration = Duration::from_secs(3600);

/// What happened to one provider during a batch run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProviderOutcome {
    Skipped {
        provider_id: i64,
        provider: String,
        next_run_at: Option<DateTime<Utc>>,
    },
    Succeeded {
        provider_id: i64,
        provider: String,
        identifier: String,
    },
    Failed {
        provider_id: i64,
        provider: String,
        error: String,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub outcomes: Vec<ProviderOutcome>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, ProviderOutcome::Succeeded { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ProviderOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ProviderOutcome::Skipped { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    fn count(&self, f: impl Fn(&ProviderOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| f(*o)).count()
    }
}

/// Marks a provider as running in this process until dropped.
struct RunClaim<'a> {
    in_flight: &'a Mutex<HashSet<i64>>,
    provider_id: i64,
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.provider_id);
        }
    }
}

pub struct SchedulerService {
    config: Arc<Config>,
    records: Arc<dyn RecordStore>,
    backups: BackupService,
    in_flight: Mutex<HashSet<i64>>,
}

impl SchedulerService {
    pub fn new(config: Arc<Config>, records: Arc<dyn RecordStore>) -> Self {
        let backups = BackupService::new(config.clone(), records.clone());
        Self {
            config,
            records,
            backups,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, provider: &BackupProvider) -> Result<RunClaim<'_>> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| AppError::Conflict("run registry lock poisoned".into()))?;
        if !set.insert(provider.id) {
            return Err(AppError::Conflict(format!(
                "A backup for provider {} is already running",
                provider.name
            )));
        }
        Ok(RunClaim {
            in_flight: &self.in_flight,
            provider_id: provider.id,
        })
    }

    /// Run every enabled provider that is due, or all of them when `force`.
    ///
    /// `provider_id` narrows the batch to one provider.
    pub async fn run_all(&self, force: bool, provider_id: Option<i64>) -> Result<RunSummary> {
        let providers: Vec<BackupProvider> = self
            .records
            .list_providers(true)
            .await?
            .into_iter()
            .filter(|p| provider_id.map_or(true, |id| p.id == id))
            .collect();

        let mut summary = RunSummary::default();
        if providers.is_empty() {
            tracing::info!("No enabled backup providers configured");
            return Ok(summary);
        }

        for provider in &providers {
            summary.outcomes.push(self.process_provider(provider, force).await);
        }

        tracing::info!(
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            skipped = summary.skipped(),
            "Backup run completed"
        );
        Ok(summary)
    }

    async fn process_provider(&self, provider: &BackupProvider, force: bool) -> ProviderOutcome {
        if !force && !provider.should_run_now(Utc::now()) {
            let next_run_at = provider.next_run_at();
            tracing::info!(
                provider = %provider.name,
                next_run_at = ?next_run_at,
                "Skipping provider, not due yet"
            );
            return ProviderOutcome::Skipped {
                provider_id: provider.id,
                provider: provider.name.clone(),
                next_run_at,
            };
        }

        let request = BackupRequest::scheduled(i64::from(provider.retention_days));
        match self.run_provider(provider, &request).await {
            Ok(result) => ProviderOutcome::Succeeded {
                provider_id: provider.id,
                provider: provider.name.clone(),
                identifier: result.identifier,
            },
            Err(e) => ProviderOutcome::Failed {
                provider_id: provider.id,
                provider: provider.name.clone(),
                error: e.to_string(),
            },
        }
    }

    /// Run one backup for a provider, recording it in the run log.
    ///
    /// Scheduled runs also advance the provider's `last_run_at`.
    pub async fn run_provider(
        &self,
        provider: &BackupProvider,
        request: &BackupRequest,
    ) -> Result<BackupResult> {
        let _claim = self.claim(provider)?;
        let log = self.records.start_run(provider.id, Utc::now()).await?;

        let outcome = async {
            let destination = destination_factory::destination_for(provider, &self.config)?;
            self.backups.run_backup(&destination, request).await
        }
        .await;

        match outcome {
            Ok(result) => {
                let completion = RunCompletion::Success {
                    identifier: result.identifier.clone(),
                    kind: result.kind,
                    size_bytes: result.size_bytes.map(|s| s as i64),
                };
                self.records
                    .complete_run(log.id, &completion, Utc::now())
                    .await?;
                if !request.manual {
                    self.records.touch_last_run(provider.id, Utc::now()).await?;
                }
                tracing::info!(
                    provider = %provider.name,
                    identifier = %result.identifier,
                    "Backup created"
                );
                Ok(result)
            }
            Err(e) => {
                let completion = RunCompletion::Failed {
                    error_message: e.to_string(),
                };
                if let Err(record_err) = self
                    .records
                    .complete_run(log.id, &completion, Utc::now())
                    .await
                {
                    tracing::error!(run_id = log.id, "Failed to record backup failure: {}", record_err);
                }
                tracing::error!(
                    provider = %provider.name,
                    provider_id = provider.id,
                    error_code = e.code(),
                    "Backup failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Mark `running` entries older than the given age as failed.
    pub async fn reconcile(&self, older_than_hours: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::hours(older_than_hours.max(0));
        let count = self
            .records
            .fail_stale_runs(cutoff, "Backup run was interrupted before completing")
            .await?;
        if count > 0 {
            tracing::warn!(count, cutoff = %cutoff, "Marked orphaned backup runs as failed");
        }
        Ok(count)
    }

    /// Periodic trigger: a non-forced `run_all` every `period` until cancelled.
    pub async fn run_daemon(&self, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(period_secs = period.as_secs(), "Backup scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tracing::debug!("Checking for due backup providers");
                    if let Err(e) = self.run_all(false, None).await {
                        tracing::warn!("Scheduled backup pass failed: {}", e);
                    }
                }
            }
        }

        tracing::info!("Backup scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::models::provider::{DriverKind, NewProvider};
    use crate::services::dump_writer::DumpOptions;
    use crate::services::record_store::MemoryRecordStore;
    use serde_json::Map;

    fn config(root: &std::path::Path) -> Arc<Config> {
        Arc::new(Config {
            database: DatabaseConfig::default(),
            records_database_url: None,
            app_key: "k".into(),
            app_url: "http://localhost".into(),
            storage_path: root.join("app"),
            scratch_path: root.join("scratch"),
            local_backup_root: root.join("remote"),
            default_retention_days: 7,
            dump: DumpOptions::default(),
            otel_endpoint: None,
        })
    }

    #[test]
    fn test_summary_counts() {
        let summary = RunSummary {
            outcomes: vec![
                ProviderOutcome::Skipped {
                    provider_id: 1,
                    provider: "a".into(),
                    next_run_at: None,
                },
                ProviderOutcome::Failed {
                    provider_id: 2,
                    provider: "b".into(),
                    error: "boom".into(),
                },
            ],
        };
        assert_eq!(summary.skipped(), 1);
        assert_eq!(summary.failed(), 1);
        assert!(summary.has_failures());
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["outcomes"][1]["status"], "failed");
    }

    #[tokio::test]
    async fn test_claim_rejects_overlap() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = SchedulerService::new(config(tmp.path()), Arc::new(MemoryRecordStore::new()));
        let provider = BackupProvider {
            id: 7,
            name: "p".into(),
            driver: DriverKind::Local,
            configuration: Map::new(),
            enabled: true,
            frequency_hours: 1,
            retention_days: 0,
            last_run_at: None,
        };

        let claim = scheduler.claim(&provider).unwrap();
        assert!(matches!(scheduler.claim(&provider), Err(AppError::Conflict(_))));
        drop(claim);
        assert!(scheduler.claim(&provider).is_ok());
    }

    #[tokio::test]
    async fn test_failed_run_is_logged() {
        let tmp = tempfile::tempdir().unwrap();
        let records = Arc::new(MemoryRecordStore::new());
        let provider = records
            .create_provider(NewProvider {
                name: "broken".into(),
                driver: DriverKind::ObjectStore,
                configuration: Map::new(),
                enabled: true,
                frequency_hours: 24,
                retention_days: 7,
            })
            .await
            .unwrap();
        let scheduler = SchedulerService::new(config(tmp.path()), records.clone());

        let summary = scheduler.run_all(false, None).await.unwrap();
        assert!(summary.has_failures());

        let runs = records.recent_runs(Some(provider.id), 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, crate::models::backup::RunStatus::Failed);
        assert!(runs[0].error_message.as_deref().unwrap().contains("bucket"));
        let stored = records.get_provider(provider.id).await.unwrap();
        assert!(stored.last_run_at.is_none());
    }

    #[tokio::test]
    async fn test_not_due_provider_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let records = Arc::new(MemoryRecordStore::new());
        let provider = records
            .create_provider(NewProvider {
                name: "recent".into(),
                driver: DriverKind::Local,
                configuration: Map::new(),
                enabled: true,
                frequency_hours: 24,
                retention_days: 7,
            })
            .await
            .unwrap();
        records.touch_last_run(provider.id, Utc::now()).await.unwrap();
        let scheduler = SchedulerService::new(config(tmp.path()), records.clone());

        let summary = scheduler.run_all(false, None).await.unwrap();
        assert_eq!(summary.skipped(), 1);
        assert!(records.recent_runs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_marks_orphans() {
        let tmp = tempfile::tempdir().unwrap();
        let records = Arc::new(MemoryRecordStore::new());
        records
            .start_run(1, Utc::now() - chrono::Duration::hours(3))
            .await
            .unwrap();
        let scheduler = SchedulerService::new(config(tmp.path()), records.clone());

        assert_eq!(scheduler.reconcile(1).await.unwrap(), 1);
        assert_eq!(scheduler.reconcile(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_daemon_stops_on_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = SchedulerService::new(config(tmp.path()), Arc::new(MemoryRecordStore::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), scheduler.run_daemon(DAEMON_PERIOD, cancel))
            .await
            .unwrap();
    }
}
