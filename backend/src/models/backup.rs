//! Backup artifacts, run log entries and the sidecar metadata contract.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Which sections a backup contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Database,
    Files,
}

impl BackupKind {
    pub fn from_sections(include_database: bool, include_storage: bool) -> Option<Self> {
        match (include_database, include_storage) {
            (true, true) => Some(BackupKind::Full),
            (true, false) => Some(BackupKind::Database),
            (false, true) => Some(BackupKind::Files),
            (false, false) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Database => "database",
            BackupKind::Files => "files",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupKind::Full),
            "database" => Ok(BackupKind::Database),
            "files" => Ok(BackupKind::Files),
            other => Err(format!("unknown backup type: {}", other)),
        }
    }
}

/// Run log status. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// One attempted backup run for a provider.
#[derive(Debug, Clone, Serialize)]
pub struct BackupLog {
    pub id: i64,
    pub provider_id: i64,
    pub identifier: Option<String>,
    pub status: RunStatus,
    pub kind: Option<BackupKind>,
    pub size_bytes: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackupLog {
    pub fn duration_secs(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_seconds())
    }
}

/// The single terminal update applied to a running log entry.
#[derive(Debug, Clone)]
pub enum RunCompletion {
    Success {
        identifier: String,
        kind: BackupKind,
        size_bytes: Option<i64>,
    },
    Failed {
        error_message: String,
    },
}

impl RunCompletion {
    pub fn status(&self) -> RunStatus {
        match self {
            RunCompletion::Success { .. } => RunStatus::Success,
            RunCompletion::Failed { .. } => RunStatus::Failed,
        }
    }
}

/// Contents of `backup.json`, written next to every stored archive.
///
/// Field names are read by other tooling and by older artifacts; they must
/// not change. Unknown fields survive a read/write cycle through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub uuid: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub created_at: String,
    pub app_key: String,
    pub app_url: String,
    pub includes_database: bool,
    pub includes_storage: bool,
    pub database_connection: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Name of the archive a backup is delivered as when downloaded.
pub fn default_filename(identifier: &str) -> String {
    format!("backup-{}.zip", identifier)
}

/// ISO-8601 with an explicit `+00:00` offset.
pub fn iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// A stored artifact as seen through a destination listing.
#[derive(Debug, Clone, Serialize)]
pub struct BackupDescriptor {
    pub identifier: String,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub size: u64,
    pub provider: String,
    pub disk: String,
    pub metadata: Map<String, Value>,
}

/// Outcome of one orchestrator run.
#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub identifier: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub includes_database: bool,
    pub includes_storage: bool,
    pub created_at: DateTime<Utc>,
    pub size_bytes: Option<u64>,
    pub metadata: Map<String, Value>,
}
