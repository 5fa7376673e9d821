//! Google Drive storage backend over the Drive v3 REST API.
//!
//! Keys map onto a folder hierarchy below `folder_id`: `backups/x.zip` is
//! the file `x.zip` inside the folder `backups`. Folders are created on
//! upload. Authentication uses a long-lived OAuth refresh token exchanged for
//! short-lived access tokens, or a fixed access token.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;

use super::{ensure_parent, join_key, key_name, normalize_dir, DriverSettings, StorageBackend};
use crate::error::{AppError, Result};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Refresh this long before the token actually expires
const TOKEN_SLACK: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct DriveConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    /// Folder every key is relative to (`root` is My Drive)
    pub folder_id: String,
}

impl std::fmt::Debug for DriveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveConfig")
            .field("client_id", &self.client_id)
            .field("folder_id", &self.folder_id)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

impl DriveConfig {
    pub fn from_settings(settings: &DriverSettings<'_>) -> Result<Self> {
        let refresh_token = settings.str("refresh_token");
        let access_token = settings.str("access_token");
        if refresh_token.is_none() && access_token.is_none() {
            return Err(AppError::Config(
                "Backup driver [google] requires [refresh_token] or [access_token]".into(),
            ));
        }
        let (client_id, client_secret) = if refresh_token.is_some() {
            (settings.required("client_id")?, settings.required("client_secret")?)
        } else {
            (settings.str_or("client_id", ""), settings.str_or("client_secret", ""))
        };
        Ok(Self {
            client_id,
            client_secret,
            refresh_token,
            access_token,
            folder_id: settings.str_or("folder_id", "root"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DriveFile {
    id: String,
    name: String,
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    /// Drive reports sizes as decimal strings
    size: Option<String>,
}

impl DriveFile {
    fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Escape a literal for the Drive search query language.
fn quote_query(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn children_query(parent: &str, name: Option<&str>, folder: Option<bool>) -> String {
    let mut q = format!("{} in parents and trashed = false", quote_query(parent));
    if let Some(name) = name {
        q.push_str(&format!(" and name = {}", quote_query(name)));
    }
    match folder {
        Some(true) => q.push_str(&format!(" and mimeType = {}", quote_query(FOLDER_MIME))),
        Some(false) => q.push_str(&format!(" and mimeType != {}", quote_query(FOLDER_MIME))),
        None => {}
    }
    q
}

async fn check(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(AppError::NotFound(format!("Drive object not found: {}", what)));
    }
    let body = response.text().await.unwrap_or_default();
    Err(AppError::Destination(format!(
        "Google Drive request for {} failed ({}): {}",
        what, status, body
    )))
}

fn http_error(what: &str, e: reqwest::Error) -> AppError {
    AppError::Destination(format!("Google Drive request for {} failed: {}", what, e))
}

/// Google Drive storage backend
pub struct DriveBackend {
    http: Client,
    config: DriveConfig,
    token: Mutex<Option<CachedToken>>,
}

impl DriveBackend {
    pub fn new(config: DriveConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let Some(refresh_token) = &self.config.refresh_token else {
            return self
                .config
                .access_token
                .clone()
                .ok_or_else(|| AppError::Config("Google Drive access token missing".into()));
        };

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| http_error("token refresh", e))?;
        let token: TokenResponse = check(response, "token refresh")
            .await?
            .json()
            .await
            .map_err(|e| http_error("token refresh", e))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_SLACK),
        });
        tracing::debug!("Refreshed Google Drive access token");
        Ok(token.access_token)
    }

    async fn search(&self, q: &str) -> Result<Vec<DriveFile>> {
        let token = self.access_token().await?;
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .http
                .get(format!("{}/files", API_BASE))
                .bearer_auth(&token)
                .query(&[
                    ("q", q),
                    ("fields", "nextPageToken,files(id,name,mimeType,size)"),
                    ("pageSize", "1000"),
                    ("supportsAllDrives", "true"),
                    ("includeItemsFromAllDrives", "true"),
                ]);
            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }
            let response = request.send().await.map_err(|e| http_error("search", e))?;
            let list: FileList = check(response, "search")
                .await?
                .json()
                .await
                .map_err(|e| http_error("search", e))?;
            files.extend(list.files);
            match list.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(files)
    }

    async fn find_child(&self, parent: &str, name: &str, folder: bool) -> Result<Option<DriveFile>> {
        let q = children_query(parent, Some(name), Some(folder));
        Ok(self.search(&q).await?.into_iter().next())
    }

    async fn create_folder(&self, parent: &str, name: &str) -> Result<String> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{}/files", API_BASE))
            .bearer_auth(&token)
            .query(&[("fields", "id,name,mimeType"), ("supportsAllDrives", "true")])
            .json(&json!({"name": name, "mimeType": FOLDER_MIME, "parents": [parent]}))
            .send()
            .await
            .map_err(|e| http_error(name, e))?;
        let folder: DriveFile = check(response, name)
            .await?
            .json()
            .await
            .map_err(|e| http_error(name, e))?;
        Ok(folder.id)
    }

    /// Folder id for a directory key. `None` when it does not exist and
    /// `create` is false.
    async fn resolve_dir(&self, dir: &str, create: bool) -> Result<Option<String>> {
        let mut current = self.config.folder_id.clone();
        for segment in normalize_dir(dir).split('/').filter(|s| !s.is_empty()) {
            current = match self.find_child(&current, segment, true).await? {
                Some(folder) => folder.id,
                None if create => self.create_folder(&current, segment).await?,
                None => return Ok(None),
            };
        }
        Ok(Some(current))
    }

    fn split_key(key: &str) -> (&str, &str) {
        match key.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", key),
        }
    }

    async fn locate(&self, key: &str) -> Result<Option<DriveFile>> {
        let (dir, name) = Self::split_key(key);
        match self.resolve_dir(dir, false).await? {
            Some(parent) => self.find_child(&parent, name, false).await,
            None => Ok(None),
        }
    }

    async fn require(&self, key: &str) -> Result<DriveFile> {
        self.locate(key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Storage key not found: {}", key)))
    }

    async fn upload(&self, key: &str, body: Body, length: Option<u64>) -> Result<()> {
        let (dir, name) = Self::split_key(key);
        let parent = self
            .resolve_dir(dir, true)
            .await?
            .ok_or_else(|| AppError::Destination(format!("Unable to create folder for {}", key)))?;
        let token = self.access_token().await?;

        let file_id = match self.find_child(&parent, name, false).await? {
            Some(existing) => existing.id,
            None => {
                let response = self
                    .http
                    .post(format!("{}/files", API_BASE))
                    .bearer_auth(&token)
                    .query(&[("fields", "id,name,mimeType"), ("supportsAllDrives", "true")])
                    .json(&json!({"name": name, "parents": [parent]}))
                    .send()
                    .await
                    .map_err(|e| http_error(key, e))?;
                let created: DriveFile = check(response, key)
                    .await?
                    .json()
                    .await
                    .map_err(|e| http_error(key, e))?;
                created.id
            }
        };

        let mut request = self
            .http
            .patch(format!("{}/files/{}", UPLOAD_BASE, file_id))
            .bearer_auth(&token)
            .query(&[("uploadType", "media"), ("supportsAllDrives", "true")])
            .body(body);
        if let Some(length) = length {
            request = request.header(CONTENT_LENGTH, length);
        }
        let response = request.send().await.map_err(|e| http_error(key, e))?;
        check(response, key).await?;

        tracing::debug!(key = %key, file_id = %file_id, "Drive upload successful");
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Response> {
        let file = self.require(key).await?;
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{}/files/{}", API_BASE, file.id))
            .bearer_auth(&token)
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .send()
            .await
            .map_err(|e| http_error(key, e))?;
        check(response, key).await
    }
}

#[async_trait]
impl StorageBackend for DriveBackend {
    fn name(&self) -> &str {
        "google"
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<()> {
        let length = content.len() as u64;
        self.upload(key, Body::from(content), Some(length)).await
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        let file = tokio::fs::File::open(source).await?;
        let length = file.metadata().await?.len();
        let body = Body::wrap_stream(ReaderStream::new(file));
        self.upload(key, body, Some(length)).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.download(key)
            .await?
            .bytes()
            .await
            .map_err(|e| http_error(key, e))
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<()> {
        let response = self.download(key).await?;
        ensure_parent(dest).await?;
        let mut out = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| http_error(key, e))?;
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.locate(key).await?.is_some())
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let file = self.require(key).await?;
        Ok(file.size.and_then(|s| s.parse().ok()).unwrap_or(0))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = normalize_dir(prefix);
        let Some(folder) = self.resolve_dir(dir, false).await? else {
            return Ok(Vec::new());
        };
        let mut keys: Vec<String> = self
            .search(&children_query(&folder, None, Some(false)))
            .await?
            .into_iter()
            .filter(|f| !f.is_folder())
            .map(|f| join_key(dir, key_name(&f.name)))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let Some(file) = self.locate(key).await? else {
            return Ok(());
        };
        let token = self.access_token().await?;
        let response = self
            .http
            .delete(format!("{}/files/{}", API_BASE, file.id))
            .bearer_auth(&token)
            .query(&[("supportsAllDrives", "true")])
            .send()
            .await
            .map_err(|e| http_error(key, e))?;
        match check(response, key).await {
            Ok(_) | Err(AppError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_query_escapes() {
        assert_eq!(quote_query("plain"), "'plain'");
        assert_eq!(quote_query("it's"), "'it\\'s'");
        assert_eq!(quote_query("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn test_children_query() {
        assert_eq!(
            children_query("root", Some("backups"), Some(true)),
            "'root' in parents and trashed = false and name = 'backups' \
             and mimeType = 'application/vnd.google-apps.folder'"
        );
        assert_eq!(
            children_query("abc", None, Some(false)),
            "'abc' in parents and trashed = false \
             and mimeType != 'application/vnd.google-apps.folder'"
        );
    }

    #[test]
    fn test_split_key() {
        assert_eq!(DriveBackend::split_key("backups/x.zip"), ("backups", "x.zip"));
        assert_eq!(DriveBackend::split_key("x.zip"), ("", "x.zip"));
    }

    #[test]
    fn test_config_requires_token() {
        let map = serde_json::json!({"client_id": "id", "client_secret": "s"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(matches!(
            DriveConfig::from_settings(&DriverSettings::new("google", &map)),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_config_refresh_token_needs_client() {
        let map = serde_json::json!({"refresh_token": "1//r"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(DriveConfig::from_settings(&DriverSettings::new("google", &map)).is_err());

        let map = serde_json::json!({"refresh_token": "1//r", "client_id": "id", "client_secret": "s"})
            .as_object()
            .cloned()
            .unwrap();
        let config = DriveConfig::from_settings(&DriverSettings::new("google", &map)).unwrap();
        assert_eq!(config.folder_id, "root");
        assert!(!format!("{:?}", config).contains("1//r"));
    }

    #[tokio::test]
    async fn test_static_access_token() {
        let map = serde_json::json!({"access_token": "ya29.token"})
            .as_object()
            .cloned()
            .unwrap();
        let backend =
            DriveBackend::new(DriveConfig::from_settings(&DriverSettings::new("google", &map)).unwrap())
                .unwrap();
        assert_eq!(backend.access_token().await.unwrap(), "ya29.token");
    }
}
