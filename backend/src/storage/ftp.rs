//! FTP storage backend.
//!
//! suppaftp's synchronous client runs on the blocking pool. Every operation
//! opens its own control connection so no session state is shared between
//! concurrent calls.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::Read;
use std::path::{Path, PathBuf};
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};

use super::{ensure_parent, join_key, key_name, normalize_dir, DriverSettings, StorageBackend};
use crate::error::{AppError, Result};

/// FTP connection settings
#[derive(Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Remote directory every key is relative to
    pub root: String,
    pub passive: bool,
}

impl std::fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("root", &self.root)
            .field("passive", &self.passive)
            .finish()
    }
}

impl FtpConfig {
    pub fn from_settings(settings: &DriverSettings<'_>) -> Result<Self> {
        Ok(Self {
            host: settings.required("host")?,
            port: settings.port(21)?,
            username: settings.str_or("username", "anonymous"),
            password: settings.str_or("password", ""),
            root: settings.str_or("root", ""),
            passive: settings.bool_or("passive", true),
        })
    }
}

fn is_missing(e: &FtpError) -> bool {
    let msg = e.to_string();
    msg.contains("550") || msg.contains("450")
}

fn ftp_error(op: &str, key: &str, e: FtpError) -> AppError {
    AppError::Destination(format!("FTP {} '{}' failed: {}", op, key, e))
}

/// FTP storage backend
pub struct FtpBackend {
    config: FtpConfig,
}

impl FtpBackend {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }

    fn remote_path(&self, key: &str) -> String {
        let root = self.config.root.trim_end_matches('/');
        if root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", root, key)
        }
    }

    /// Run a session-scoped operation on the blocking pool.
    async fn with_session<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T> + Send + 'static,
    {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut ftp = FtpStream::connect((config.host.as_str(), config.port)).map_err(|e| {
                AppError::Destination(format!(
                    "Unable to connect to FTP server {}:{}: {}",
                    config.host, config.port, e
                ))
            })?;
            ftp.login(config.username.as_str(), config.password.as_str())
                .map_err(|e| AppError::Destination(format!("FTP login failed: {}", e)))?;
            ftp.transfer_type(FileType::Binary)
                .map_err(|e| AppError::Destination(format!("FTP binary mode failed: {}", e)))?;
            if !config.passive {
                ftp.set_mode(Mode::Active);
            }

            let result = op(&mut ftp);
            let _ = ftp.quit();
            result
        })
        .await?
    }
}

/// Create every directory leading up to `path`, ignoring ones that exist.
fn make_parents(ftp: &mut FtpStream, path: &str) {
    let mut current = String::new();
    let segments: Vec<&str> = path.split('/').collect();
    for segment in &segments[..segments.len().saturating_sub(1)] {
        if segment.is_empty() {
            current.push('/');
            continue;
        }
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(segment);
        let _ = ftp.mkdir(&current);
    }
}

#[async_trait]
impl StorageBackend for FtpBackend {
    fn name(&self) -> &str {
        "ftp"
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<()> {
        let remote = self.remote_path(key);
        let key = key.to_string();
        self.with_session(move |ftp| {
            make_parents(ftp, &remote);
            ftp.put_file(&remote, &mut content.as_ref())
                .map_err(|e| ftp_error("upload", &key, e))?;
            Ok(())
        })
        .await
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        let remote = self.remote_path(key);
        let key = key.to_string();
        let source = source.to_path_buf();
        self.with_session(move |ftp| {
            make_parents(ftp, &remote);
            let mut file = std::io::BufReader::new(std::fs::File::open(&source)?);
            ftp.put_file(&remote, &mut file)
                .map_err(|e| ftp_error("upload", &key, e))?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let remote = self.remote_path(key);
        let key = key.to_string();
        self.with_session(move |ftp| match ftp.retr_as_buffer(&remote) {
            Ok(cursor) => Ok(Bytes::from(cursor.into_inner())),
            Err(e) if is_missing(&e) => Err(AppError::NotFound(format!(
                "Storage key not found: {}",
                key
            ))),
            Err(e) => Err(ftp_error("download", &key, e)),
        })
        .await
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<()> {
        ensure_parent(dest).await?;
        let remote = self.remote_path(key);
        let key = key.to_string();
        let dest: PathBuf = dest.to_path_buf();
        self.with_session(move |ftp| {
            let mut out = std::fs::File::create(&dest)?;
            let copied = ftp.retr(&remote, |reader: &mut dyn Read| {
                std::io::copy(reader, &mut out).map_err(FtpError::ConnectionError)
            });
            match copied {
                Ok(_) => Ok(()),
                Err(e) if is_missing(&e) => Err(AppError::NotFound(format!(
                    "Storage key not found: {}",
                    key
                ))),
                Err(e) => Err(ftp_error("download", &key, e)),
            }
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.size(key).await {
            Ok(_) => Ok(true),
            Err(AppError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let remote = self.remote_path(key);
        let key = key.to_string();
        self.with_session(move |ftp| match ftp.size(&remote) {
            Ok(size) => Ok(size as u64),
            Err(e) if is_missing(&e) => Err(AppError::NotFound(format!(
                "Storage key not found: {}",
                key
            ))),
            Err(e) => Err(ftp_error("size", &key, e)),
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = normalize_dir(prefix).to_string();
        let remote_dir = if dir.is_empty() {
            let root = self.config.root.trim_end_matches('/');
            if root.is_empty() {
                ".".to_string()
            } else {
                root.to_string()
            }
        } else {
            self.remote_path(&dir)
        };

        let names = self
            .with_session(move |ftp| match ftp.nlst(Some(remote_dir.as_str())) {
                Ok(names) => Ok(names),
                Err(e) if is_missing(&e) => Ok(Vec::new()),
                Err(e) => Err(ftp_error("list", &remote_dir, e)),
            })
            .await?;

        let mut keys: Vec<String> = names
            .iter()
            .map(|n| key_name(n.trim_end_matches('/')))
            .filter(|n| !n.is_empty() && *n != "." && *n != "..")
            .map(|n| join_key(&dir, n))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let remote = self.remote_path(key);
        let key = key.to_string();
        self.with_session(move |ftp| match ftp.rm(&remote) {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(ftp_error("delete", &key, e)),
        })
        .await
    }
}
