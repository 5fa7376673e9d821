//! Execution of backup-keeper commands.

use serde_json::{json, Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cli::commands::{output, table_row, Command, OutputFormat, ProviderCommand, RestoreScopeArgs};
use crate::config::Config;
use crate::db;
use crate::error::{AppError, Result};
use crate::models::provider::{DriverKind, NewProvider};
use crate::services::backup_service::BackupRequest;
use crate::services::destination_factory;
use crate::services::encryption::ConfigCipher;
use crate::services::record_store::RecordStore;
use crate::services::restore_service::{RestoreScope, RestoreService};
use crate::services::scheduler_service::{ProviderOutcome, SchedulerService, DAEMON_PERIOD};
use crate::services::sql_record_store::SqlRecordStore;

/// Open the SQL record store described by the configuration.
pub async fn open_records(config: &Config) -> Result<Arc<dyn RecordStore>> {
    let options = db::records_connect_options(config)?;
    if config.app_key.is_empty() {
        return Err(AppError::Config(
            "APP_KEY is required to read provider configuration".into(),
        ));
    }
    let cipher = ConfigCipher::new(&config.app_key)?;
    let pool = db::create_records_pool(options).await?;
    tracing::debug!("Connected to record store");
    Ok(Arc::new(SqlRecordStore::new(pool, cipher)))
}

/// Execute one command. `Ok(false)` means it ran but some work failed.
pub async fn execute(
    command: Command,
    format: OutputFormat,
    config: Arc<Config>,
    records: Arc<dyn RecordStore>,
) -> Result<bool> {
    match command {
        Command::Run { force, provider } => run_scheduled(format, config, records, force, provider).await,
        Command::Backup {
            provider,
            database,
            storage,
        } => run_manual(format, config, records, provider, database, storage).await,
        Command::List { provider } => run_list(format, &config, records.as_ref(), provider).await,
        Command::Download { identifier, path } => {
            let (provider, destination) =
                destination_factory::require(records.as_ref(), &config, &identifier).await?;
            destination.download(&identifier, &path).await?;
            output(
                format,
                &format!("Downloaded {} from {} to {}", identifier, provider.name, path.display()),
                json!({"identifier": identifier, "provider": provider.name, "path": path}),
            );
            Ok(true)
        }
        Command::Delete { identifier } => {
            let (provider, destination) =
                destination_factory::require(records.as_ref(), &config, &identifier).await?;
            destination.delete(&identifier).await?;
            let runs = records.delete_runs_by_identifier(&identifier).await?;
            tracing::info!(provider = %provider.name, identifier = %identifier, runs, "Backup deleted");
            output(
                format,
                &format!("Deleted backup {} from {}", identifier, provider.name),
                json!({"identifier": identifier, "provider": provider.name, "deleted_runs": runs}),
            );
            Ok(true)
        }
        Command::Restore {
            identifier,
            scope,
            yes,
        } => {
            let report = RestoreService::new(config, records)
                .restore(&identifier, restore_scope(&scope), yes)
                .await?;
            output(
                format,
                &format!(
                    "Restored {} (database: {}, storage: {})",
                    report.identifier, report.database_restored, report.storage_restored
                ),
                serde_json::to_value(&report)?,
            );
            Ok(true)
        }
        Command::Provider { command } => run_provider_command(format, records.as_ref(), command).await,
        Command::Logs { provider, limit } => {
            let runs = records.recent_runs(provider, limit).await?;
            match format {
                OutputFormat::Json => output(format, "", serde_json::to_value(&runs)?),
                OutputFormat::Text => {
                    table_row(&["ID", "PROVIDER", "STATUS", "IDENTIFIER", "STARTED", "ERROR"]);
                    for run in &runs {
                        table_row(&[
                            &run.id.to_string(),
                            &run.provider_id.to_string(),
                            run.status.as_str(),
                            run.identifier.as_deref().unwrap_or("-"),
                            &run.started_at.to_rfc3339(),
                            run.error_message.as_deref().unwrap_or(""),
                        ]);
                    }
                }
            }
            Ok(true)
        }
        Command::Reconcile { older_than_hours } => {
            let count = SchedulerService::new(config, records)
                .reconcile(older_than_hours)
                .await?;
            output(
                format,
                &format!("Marked {} orphaned run(s) as failed", count),
                json!({"failed_runs": count}),
            );
            Ok(true)
        }
        Command::Daemon => {
            let scheduler = SchedulerService::new(config, records);
            let cancel = CancellationToken::new();
            let signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown requested");
                }
                signal.cancel();
            });
            scheduler.run_daemon(DAEMON_PERIOD, cancel).await;
            Ok(true)
        }
    }
}

async fn run_scheduled(
    format: OutputFormat,
    config: Arc<Config>,
    records: Arc<dyn RecordStore>,
    force: bool,
    provider: Option<i64>,
) -> Result<bool> {
    let summary = SchedulerService::new(config, records)
        .run_all(force, provider)
        .await?;

    if format == OutputFormat::Text {
        for outcome in &summary.outcomes {
            match outcome {
                ProviderOutcome::Skipped {
                    provider,
                    next_run_at,
                    ..
                } => {
                    let next = next_run_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "-".into());
                    println!("Skipping provider {}: next run scheduled at {}", provider, next);
                }
                ProviderOutcome::Succeeded {
                    provider,
                    identifier,
                    ..
                } => println!("Backup {} created on {}", identifier, provider),
                ProviderOutcome::Failed { provider, error, .. } => {
                    println!("Backup on {} failed: {}", provider, error)
                }
            }
        }
    }
    output(
        format,
        &format!(
            "Backup run completed: {} successful, {} failed",
            summary.succeeded(),
            summary.failed()
        ),
        serde_json::to_value(&summary)?,
    );
    Ok(!summary.has_failures())
}

async fn run_manual(
    format: OutputFormat,
    config: Arc<Config>,
    records: Arc<dyn RecordStore>,
    provider_id: i64,
    database: bool,
    storage: bool,
) -> Result<bool> {
    let provider = records.get_provider(provider_id).await?;
    let (database, storage) = manual_sections(database, storage);
    let request = BackupRequest::manual(database, storage, i64::from(provider.retention_days));

    let result = SchedulerService::new(config, records)
        .run_provider(&provider, &request)
        .await?;
    output(
        format,
        &format!(
            "Backup {} ({}) created on {}",
            result.identifier, result.kind, provider.name
        ),
        serde_json::to_value(&result)?,
    );
    Ok(true)
}

/// Neither flag means both sections.
fn manual_sections(database: bool, storage: bool) -> (bool, bool) {
    if !database && !storage {
        (true, true)
    } else {
        (database, storage)
    }
}

fn restore_scope(args: &RestoreScopeArgs) -> RestoreScope {
    if args.database {
        RestoreScope::Database
    } else if args.storage {
        RestoreScope::Storage
    } else {
        RestoreScope::All
    }
}

async fn run_list(
    format: OutputFormat,
    config: &Config,
    records: &dyn RecordStore,
    provider: Option<i64>,
) -> Result<bool> {
    let backups = destination_factory::list_backups(records, config, provider).await?;
    match format {
        OutputFormat::Json => output(format, "", serde_json::to_value(&backups)?),
        OutputFormat::Text => {
            table_row(&["IDENTIFIER", "TYPE", "CREATED", "SIZE", "PROVIDER", "DISK"]);
            for backup in &backups {
                table_row(&[
                    &backup.identifier,
                    backup.kind.as_str(),
                    &backup.created_at.to_rfc3339(),
                    &backup.size.to_string(),
                    &backup.provider,
                    &backup.disk,
                ]);
            }
        }
    }
    Ok(true)
}

async fn run_provider_command(
    format: OutputFormat,
    records: &dyn RecordStore,
    command: ProviderCommand,
) -> Result<bool> {
    match command {
        ProviderCommand::Add {
            name,
            driver,
            config,
            frequency_hours,
            retention_days,
            disabled,
        } => {
            let provider = records
                .create_provider(NewProvider {
                    name,
                    driver: DriverKind::from_str(&driver)?,
                    configuration: parse_configuration(&config)?,
                    enabled: !disabled,
                    frequency_hours,
                    retention_days,
                })
                .await?;
            output(
                format,
                &format!("Provider {} registered with id {}", provider.name, provider.id),
                serde_json::to_value(&provider)?,
            );
        }
        ProviderCommand::List => {
            let providers = records.list_providers(false).await?;
            match format {
                OutputFormat::Json => output(format, "", serde_json::to_value(&providers)?),
                OutputFormat::Text => {
                    table_row(&["ID", "NAME", "DRIVER", "ENABLED", "EVERY", "KEEP", "LAST RUN"]);
                    for p in &providers {
                        let last_run = p
                            .last_run_at
                            .map(|at| at.to_rfc3339())
                            .unwrap_or_else(|| "never".into());
                        table_row(&[
                            &p.id.to_string(),
                            &p.name,
                            p.driver.as_str(),
                            if p.enabled { "yes" } else { "no" },
                            &format!("{}h", p.frequency_hours),
                            &format!("{}d", p.retention_days),
                            &last_run,
                        ]);
                    }
                }
            }
        }
    }
    Ok(true)
}

fn parse_configuration(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AppError::InvalidRequest(
            "Provider configuration must be a JSON object".into(),
        )),
        Err(e) => Err(AppError::InvalidRequest(format!(
            "Provider configuration is not valid JSON: {}",
            e
        ))),
    }
}
