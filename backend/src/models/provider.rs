//! Backup provider: a named, scheduled destination configuration.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Transport family a provider stores its artifacts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverKind {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "ftp")]
    Ftp,
    #[serde(rename = "sftp")]
    Sftp,
    #[serde(rename = "s3", alias = "object-store")]
    ObjectStore,
    #[serde(rename = "google", alias = "cloud-drive")]
    CloudDrive,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Local => "local",
            DriverKind::Ftp => "ftp",
            DriverKind::Sftp => "sftp",
            DriverKind::ObjectStore => "s3",
            DriverKind::CloudDrive => "google",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(DriverKind::Local),
            "ftp" => Ok(DriverKind::Ftp),
            "sftp" => Ok(DriverKind::Sftp),
            "s3" | "object-store" => Ok(DriverKind::ObjectStore),
            "google" | "cloud-drive" => Ok(DriverKind::CloudDrive),
            other => Err(AppError::Config(format!(
                "Unsupported backup driver [{}]",
                other
            ))),
        }
    }
}

/// A configured backup target.
#[derive(Clone, Serialize)]
pub struct BackupProvider {
    pub id: i64,
    pub name: String,
    pub driver: DriverKind,
    /// Decrypted driver configuration. Encrypted whenever it is persisted.
    #[serde(skip_serializing)]
    pub configuration: Map<String, Value>,
    pub enabled: bool,
    pub frequency_hours: i32,
    pub retention_days: i32,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for BackupProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupProvider")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("driver", &self.driver)
            .field("configuration_keys", &self.configuration.keys().collect::<Vec<_>>())
            .field("enabled", &self.enabled)
            .field("frequency_hours", &self.frequency_hours)
            .field("retention_days", &self.retention_days)
            .field("last_run_at", &self.last_run_at)
            .finish()
    }
}

impl BackupProvider {
    /// Earliest time the scheduler considers this provider due again.
    ///
    /// `None` when the provider never ran.
    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        let frequency = i64::from(self.frequency_hours.max(1));
        self.last_run_at
            .map(|last| last + Duration::hours(frequency))
    }

    /// Advisory only: this is a timestamp comparison, not a lock.
    pub fn should_run_now(&self, now: DateTime<Utc>) -> bool {
        match self.next_run_at() {
            None => true,
            Some(next) => next < now,
        }
    }
}

/// Fields for creating a provider record.
#[derive(Debug, Clone)]
pub struct NewProvider {
    pub name: String,
    pub driver: DriverKind,
    pub configuration: Map<String, Value>,
    pub enabled: bool,
    pub frequency_hours: i32,
    pub retention_days: i32,
}

impl NewProvider {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::InvalidRequest("provider name is required".into()));
        }
        if self.frequency_hours < 1 {
            return Err(AppError::InvalidRequest(
                "frequency_hours must be at least 1".into(),
            ));
        }
        if self.retention_days < 0 {
            return Err(AppError::InvalidRequest(
                "retention_days must not be negative".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn provider(last_run_at: Option<DateTime<Utc>>, frequency_hours: i32) -> BackupProvider {
        BackupProvider {
            id: 1,
            name: "primary".into(),
            driver: DriverKind::Local,
            configuration: Map::new(),
            enabled: true,
            frequency_hours,
            retention_days: 7,
            last_run_at,
        }
    }

    #[test]
    fn test_never_run_is_due() {
        let now = Utc::now();
        assert!(provider(None, 24).should_run_now(now));
    }

    #[test]
    fn test_due_after_frequency_elapsed() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let p = provider(Some(now - Duration::hours(25)), 24);
        assert!(p.should_run_now(now));
        let p = provider(Some(now - Duration::hours(2)), 24);
        assert!(!p.should_run_now(now));
        assert_eq!(p.next_run_at(), Some(now + Duration::hours(22)));
    }

    #[test]
    fn test_frequency_floor_is_one_hour() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let p = provider(Some(now - Duration::minutes(30)), 0);
        assert_eq!(p.next_run_at(), Some(now + Duration::minutes(30)));
        assert!(!p.should_run_now(now));
    }

    #[test]
    fn test_driver_aliases() {
        assert_eq!("s3".parse::<DriverKind>().unwrap(), DriverKind::ObjectStore);
        assert_eq!("object-store".parse::<DriverKind>().unwrap(), DriverKind::ObjectStore);
        assert_eq!("Google".parse::<DriverKind>().unwrap(), DriverKind::CloudDrive);
        assert!(matches!("dropbox".parse::<DriverKind>(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_debug_hides_configuration_values() {
        let mut p = provider(None, 24);
        p.configuration
            .insert("password".into(), Value::String("hunter2".into()));
        let rendered = format!("{:?}", p);
        assert!(rendered.contains("password"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_new_provider_validation() {
        let mut new = NewProvider {
            name: "nightly".into(),
            driver: DriverKind::Local,
            configuration: Map::new(),
            enabled: true,
            frequency_hours: 24,
            retention_days: 0,
        };
        assert!(new.validate().is_ok());
        new.frequency_hours = 0;
        assert!(new.validate().is_err());
    }
}
