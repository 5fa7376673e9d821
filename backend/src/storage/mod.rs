//! Storage transports.
//!
//! A transport moves opaque objects addressed by `/`-separated keys. The
//! backup destination logic is written once against [`StorageBackend`]; each
//! driver only supplies the primitive reads, writes, listings and deletes.

pub mod filesystem;
#[cfg(feature = "ftp")]
pub mod ftp;
pub mod gdrive;
pub mod s3;
#[cfg(feature = "sftp")]
pub mod sftp;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};

/// Storage backend trait
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name, stamped into sidecar metadata as `disk`
    fn name(&self) -> &str;

    /// Store content under the key, replacing any existing object
    async fn put(&self, key: &str, content: Bytes) -> Result<()>;

    /// Upload a local file. Transports that can stream override this.
    async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        let content = tokio::fs::read(source).await?;
        self.put(key, Bytes::from(content)).await
    }

    /// Retrieve content by key. A missing key is `AppError::NotFound`.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Download an object into a local file, creating parent directories.
    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<()> {
        let content = self.get(key).await?;
        ensure_parent(dest).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        file.write_all(&content).await?;
        file.flush().await?;
        Ok(())
    }

    /// Check if key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Object size in bytes
    async fn size(&self, key: &str) -> Result<u64>;

    /// Keys of the objects directly inside `prefix` ("" is the root).
    ///
    /// A prefix that does not exist lists as empty.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Join a directory key and a name. An empty or `.` directory is the root.
pub fn join_key(dir: &str, name: &str) -> String {
    let dir = normalize_dir(dir);
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Trim slashes and map `.` to the root.
pub fn normalize_dir(dir: &str) -> &str {
    let trimmed = dir.trim_matches('/');
    if trimmed == "." {
        ""
    } else {
        trimmed
    }
}

/// Last segment of a key.
pub fn key_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Reject keys that could escape a transport root.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.split('/').any(|seg| seg == "..") || key.contains('\0') {
        return Err(AppError::InvalidRequest(format!("Invalid storage key: {:?}", key)));
    }
    Ok(())
}

pub(crate) async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

/// Typed accessors over a provider's configuration map.
///
/// Values may arrive as JSON strings even when numeric or boolean, since
/// administrators edit them as text.
pub struct DriverSettings<'a> {
    driver: &'a str,
    map: &'a Map<String, Value>,
}

impl<'a> DriverSettings<'a> {
    pub fn new(driver: &'a str, map: &'a Map<String, Value>) -> Self {
        Self { driver, map }
    }

    pub fn str(&self, key: &str) -> Option<String> {
        match self.map.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn required(&self, key: &str) -> Result<String> {
        self.str(key).ok_or_else(|| {
            AppError::Config(format!(
                "Backup driver [{}] requires configuration key [{}]",
                self.driver, key
            ))
        })
    }

    pub fn str_or(&self, key: &str, default: &str) -> String {
        self.str(key).unwrap_or_else(|| default.to_string())
    }

    pub fn port(&self, default: u16) -> Result<u16> {
        match self.str("port") {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                AppError::Config(format!("Backup driver [{}] has invalid port [{}]", self.driver, raw))
            }),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.map.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(default),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => default,
            },
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("backups", "a.zip"), "backups/a.zip");
        assert_eq!(join_key("/backups/", "a.zip"), "backups/a.zip");
        assert_eq!(join_key("", "a.zip"), "a.zip");
        assert_eq!(join_key(".", "a.zip"), "a.zip");
    }

    #[test]
    fn test_key_name() {
        assert_eq!(key_name("backups/x/a.json"), "a.json");
        assert_eq!(key_name("a.json"), "a.json");
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("backups/a.zip").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("backups/../../x").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn test_driver_settings() {
        let map = json!({
            "host": " ftp.example.com ",
            "port": "2121",
            "passive": "false",
            "ssl": 1,
            "empty": ""
        })
        .as_object()
        .cloned()
        .unwrap();
        let settings = DriverSettings::new("ftp", &map);
        assert_eq!(settings.required("host").unwrap(), "ftp.example.com");
        assert_eq!(settings.port(21).unwrap(), 2121);
        assert!(!settings.bool_or("passive", true));
        assert!(settings.bool_or("ssl", false));
        assert!(settings.str("empty").is_none());
        assert!(matches!(settings.required("username"), Err(AppError::Config(_))));
    }

    #[test]
    fn test_numeric_port_and_default() {
        let map = json!({"port": 22}).as_object().cloned().unwrap();
        assert_eq!(DriverSettings::new("sftp", &map).port(21).unwrap(), 22);
        let empty = Map::new();
        assert_eq!(DriverSettings::new("sftp", &empty).port(22).unwrap(), 22);
        let bad = json!({"port": "http"}).as_object().cloned().unwrap();
        assert!(DriverSettings::new("sftp", &bad).port(22).is_err());
    }
}
