//! SFTP storage backend on libssh2.
//!
//! Like the FTP transport, each operation runs on the blocking pool with its
//! own SSH session.

use async_trait::async_trait;
use bytes::Bytes;
use ssh2::{ErrorCode, Session, Sftp};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use super::{ensure_parent, join_key, normalize_dir, DriverSettings, StorageBackend};
use crate::error::{AppError, Result};

/// libssh2 status for a missing remote file
const SFTP_NO_SUCH_FILE: i32 = 2;

/// SFTP connection settings
#[derive(Clone)]
pub struct SftpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    /// Path to a private key file, preferred over the password when set
    pub private_key: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub root: String,
}

impl std::fmt::Debug for SftpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("private_key", &self.private_key)
            .field("root", &self.root)
            .finish()
    }
}

impl SftpConfig {
    pub fn from_settings(settings: &DriverSettings<'_>) -> Result<Self> {
        let password = settings.str("password");
        let private_key = settings.str("private_key").map(PathBuf::from);
        if password.is_none() && private_key.is_none() {
            return Err(AppError::Config(
                "Backup driver [sftp] requires either [password] or [private_key]".into(),
            ));
        }
        Ok(Self {
            host: settings.required("host")?,
            port: settings.port(22)?,
            username: settings.required("username")?,
            password,
            private_key,
            passphrase: settings.str("passphrase"),
            root: settings.str_or("root", ""),
        })
    }
}

fn is_missing(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE))
}

fn sftp_error(op: &str, key: &str, e: ssh2::Error) -> AppError {
    AppError::Destination(format!("SFTP {} '{}' failed: {}", op, key, e))
}

fn missing_key(key: &str) -> AppError {
    AppError::NotFound(format!("Storage key not found: {}", key))
}

/// SFTP storage backend
pub struct SftpBackend {
    config: SftpConfig,
}

impl SftpBackend {
    pub fn new(config: SftpConfig) -> Self {
        Self { config }
    }

    fn remote_path(&self, key: &str) -> PathBuf {
        let root = self.config.root.trim_end_matches('/');
        if root.is_empty() {
            PathBuf::from(key)
        } else {
            PathBuf::from(format!("{}/{}", root, key))
        }
    }

    async fn with_sftp<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
    {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let connect_err = |e: &dyn std::fmt::Display| {
                AppError::Destination(format!(
                    "Unable to connect to SFTP server {}:{}: {}",
                    config.host, config.port, e
                ))
            };
            let tcp = TcpStream::connect((config.host.as_str(), config.port))
                .map_err(|e| connect_err(&e))?;
            let mut session = Session::new().map_err(|e| connect_err(&e))?;
            session.set_tcp_stream(tcp);
            session.handshake().map_err(|e| connect_err(&e))?;

            let auth = match (&config.private_key, &config.password) {
                (Some(key), _) => session.userauth_pubkey_file(
                    &config.username,
                    None,
                    key,
                    config.passphrase.as_deref(),
                ),
                (None, Some(password)) => session.userauth_password(&config.username, password),
                (None, None) => {
                    return Err(AppError::Config("SFTP credentials missing".into()));
                }
            };
            auth.map_err(|e| AppError::Destination(format!("SFTP authentication failed: {}", e)))?;

            let sftp = session.sftp().map_err(|e| connect_err(&e))?;
            op(&sftp)
        })
        .await?
    }
}

fn make_parents(sftp: &Sftp, path: &Path) {
    let mut ancestors: Vec<&Path> = path
        .ancestors()
        .skip(1)
        .filter(|p| !p.as_os_str().is_empty() && *p != Path::new("/"))
        .collect();
    ancestors.reverse();
    for dir in ancestors {
        if sftp.stat(dir).is_err() {
            let _ = sftp.mkdir(dir, 0o755);
        }
    }
}

#[async_trait]
impl StorageBackend for SftpBackend {
    fn name(&self) -> &str {
        "sftp"
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<()> {
        let remote = self.remote_path(key);
        let key = key.to_string();
        self.with_sftp(move |sftp| {
            make_parents(sftp, &remote);
            let mut file = sftp
                .create(&remote)
                .map_err(|e| sftp_error("upload", &key, e))?;
            file.write_all(&content)?;
            Ok(())
        })
        .await
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        let remote = self.remote_path(key);
        let key = key.to_string();
        let source = source.to_path_buf();
        self.with_sftp(move |sftp| {
            make_parents(sftp, &remote);
            let mut input = std::fs::File::open(&source)?;
            let mut file = sftp
                .create(&remote)
                .map_err(|e| sftp_error("upload", &key, e))?;
            std::io::copy(&mut input, &mut file)?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let remote = self.remote_path(key);
        let key = key.to_string();
        self.with_sftp(move |sftp| {
            let mut file = sftp.open(&remote).map_err(|e| {
                if is_missing(&e) {
                    missing_key(&key)
                } else {
                    sftp_error("download", &key, e)
                }
            })?;
            let mut content = Vec::new();
            file.read_to_end(&mut content)?;
            Ok(Bytes::from(content))
        })
        .await
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<()> {
        ensure_parent(dest).await?;
        let remote = self.remote_path(key);
        let key = key.to_string();
        let dest = dest.to_path_buf();
        self.with_sftp(move |sftp| {
            let mut file = sftp.open(&remote).map_err(|e| {
                if is_missing(&e) {
                    missing_key(&key)
                } else {
                    sftp_error("download", &key, e)
                }
            })?;
            let mut out = std::fs::File::create(&dest)?;
            std::io::copy(&mut file, &mut out)?;
            Ok(())
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let remote = self.remote_path(key);
        let key = key.to_string();
        self.with_sftp(move |sftp| match sftp.stat(&remote) {
            Ok(stat) => Ok(stat.is_file()),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(sftp_error("stat", &key, e)),
        })
        .await
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let remote = self.remote_path(key);
        let key = key.to_string();
        self.with_sftp(move |sftp| match sftp.stat(&remote) {
            Ok(stat) => Ok(stat.size.unwrap_or(0)),
            Err(e) if is_missing(&e) => Err(missing_key(&key)),
            Err(e) => Err(sftp_error("stat", &key, e)),
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = normalize_dir(prefix).to_string();
        let remote_dir = if dir.is_empty() {
            let root = self.config.root.trim_end_matches('/');
            PathBuf::from(if root.is_empty() { "." } else { root })
        } else {
            self.remote_path(&dir)
        };

        let entries = self
            .with_sftp(move |sftp| match sftp.readdir(&remote_dir) {
                Ok(entries) => Ok(entries),
                Err(e) if is_missing(&e) => Ok(Vec::new()),
                Err(e) => Err(sftp_error("list", &remote_dir.display().to_string(), e)),
            })
            .await?;

        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, stat)| stat.is_file())
            .filter_map(|(path, _)| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .map(|name| join_key(&dir, &name))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let remote = self.remote_path(key);
        let key = key.to_string();
        self.with_sftp(move |sftp| match sftp.unlink(&remote) {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(sftp_error("delete", &key, e)),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_needs_a_credential() {
        let map = json!({"host": "sftp.example.com", "username": "backup"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(matches!(
            SftpConfig::from_settings(&DriverSettings::new("sftp", &map)),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_config_with_key_file() {
        let map = json!({
            "host": "sftp.example.com",
            "port": "2222",
            "username": "backup",
            "private_key": "/etc/backup/id_ed25519",
            "passphrase": "secret-phrase",
            "root": "/data"
        })
        .as_object()
        .cloned()
        .unwrap();
        let config = SftpConfig::from_settings(&DriverSettings::new("sftp", &map)).unwrap();
        assert_eq!(config.port, 2222);
        assert_eq!(config.private_key.as_deref(), Some(Path::new("/etc/backup/id_ed25519")));
        assert!(!format!("{:?}", config).contains("secret-phrase"));

        let backend = SftpBackend::new(config);
        assert_eq!(backend.remote_path("app/x.zip"), PathBuf::from("/data/app/x.zip"));
    }
}
