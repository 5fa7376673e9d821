//! S3 storage backend using rust-s3 crate.
//!
//! Supports AWS S3 and S3-compatible services (MinIO, etc.). Provider
//! configuration keys:
//! - `bucket`: Bucket name (required)
//! - `region`: AWS region (default: us-east-1)
//! - `endpoint`: Custom endpoint URL for S3-compatible services
//! - `key` / `secret`: Access key pair (optional, falls back to the default
//!   credential chain)
//! - `root`: Key prefix for every object
//! - `use_path_style_endpoint`: Force path-style addressing (implied by `endpoint`)

use async_trait::async_trait;
use bytes::Bytes;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;
use std::path::Path;

use super::{ensure_parent, join_key, normalize_dir, DriverSettings, StorageBackend};
use crate::error::{AppError, Result};

/// S3 storage backend configuration
#[derive(Clone)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint URL (for MinIO compatibility)
    pub endpoint: Option<String>,
    /// Optional key prefix for all objects
    pub prefix: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("prefix", &self.prefix)
            .field("access_key", &self.access_key)
            .field("path_style", &self.path_style)
            .finish()
    }
}

impl S3Config {
    /// Build from a provider configuration map
    pub fn from_settings(settings: &DriverSettings<'_>) -> Result<Self> {
        let endpoint = settings.str("endpoint");
        Ok(Self {
            bucket: settings.required("bucket")?,
            region: settings.str_or("region", "us-east-1"),
            path_style: settings.bool_or("use_path_style_endpoint", false) || endpoint.is_some(),
            endpoint,
            prefix: settings
                .str("root")
                .map(|r| normalize_dir(&r).to_string())
                .filter(|r| !r.is_empty()),
            access_key: settings.str("key"),
            secret_key: settings.str("secret"),
        })
    }
}

/// S3-compatible storage backend
pub struct S3Backend {
    bucket: Box<Bucket>,
    prefix: Option<String>,
}

fn is_not_found(e: &s3::error::S3Error) -> bool {
    let err_str = e.to_string();
    err_str.contains("404") || err_str.contains("NoSuchKey") || err_str.contains("Not Found")
}

impl S3Backend {
    /// Create new S3 backend from configuration
    pub fn new(config: S3Config) -> Result<Self> {
        let credentials = match (&config.access_key, &config.secret_key) {
            (Some(key), Some(secret)) => {
                Credentials::new(Some(key.as_str()), Some(secret.as_str()), None, None, None)
                    .map_err(|e| AppError::Config(format!("Invalid S3 credentials: {}", e)))?
            }
            // env vars -> ~/.aws/credentials -> container credentials -> instance metadata
            _ => Credentials::default()
                .map_err(|e| AppError::Config(format!("Failed to load AWS credentials: {}", e)))?,
        };

        let region = match &config.endpoint {
            Some(endpoint) => Region::Custom {
                region: config.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config
                .region
                .parse()
                .map_err(|_| AppError::Config(format!("Invalid S3 region: {}", config.region)))?,
        };

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| AppError::Config(format!("Failed to create S3 bucket: {}", e)))?;

        // Path-style access for MinIO compatibility
        let bucket = if config.path_style {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Self {
            bucket,
            prefix: config.prefix,
        })
    }

    /// Generate the full S3 key with optional prefix
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }

    /// Strip the prefix from an S3 key
    fn strip_prefix(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => {
                let prefix_with_slash = format!("{}/", prefix.trim_end_matches('/'));
                key.strip_prefix(&prefix_with_slash)
                    .unwrap_or(key)
                    .to_string()
            }
            None => key.to_string(),
        }
    }

    /// Listing prefix for a directory key, always ending in `/` unless it is the bucket root.
    fn list_prefix(&self, dir: &str) -> String {
        let dir = normalize_dir(dir);
        match (&self.prefix, dir.is_empty()) {
            (Some(base), true) => format!("{}/", base.trim_end_matches('/')),
            (Some(base), false) => format!("{}/{}/", base.trim_end_matches('/'), dir),
            (None, true) => String::new(),
            (None, false) => format!("{}/", dir),
        }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        "s3"
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<()> {
        let full_key = self.full_key(key);

        self.bucket
            .put_object(&full_key, &content)
            .await
            .map_err(|e| AppError::Destination(format!("Failed to put object '{}': {}", key, e)))?;

        tracing::debug!(key = %key, "S3 put object successful");
        Ok(())
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        let full_key = self.full_key(key);
        let mut file = tokio::fs::File::open(source).await?;

        self.bucket
            .put_object_stream(&mut file, &full_key)
            .await
            .map_err(|e| AppError::Destination(format!("Failed to upload '{}': {}", key, e)))?;

        tracing::debug!(key = %key, "S3 streamed upload successful");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let full_key = self.full_key(key);

        let response = self.bucket.get_object(&full_key).await.map_err(|e| {
            if is_not_found(&e) {
                AppError::NotFound(format!("Storage key not found: {}", key))
            } else {
                AppError::Destination(format!("Failed to get object '{}': {}", key, e))
            }
        })?;

        tracing::debug!(key = %key, size = response.bytes().len(), "S3 get object successful");
        Ok(Bytes::from(response.to_vec()))
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<()> {
        let full_key = self.full_key(key);
        ensure_parent(dest).await?;
        let mut file = tokio::fs::File::create(dest).await?;

        self.bucket
            .get_object_to_writer(&full_key, &mut file)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    AppError::NotFound(format!("Storage key not found: {}", key))
                } else {
                    AppError::Destination(format!("Failed to download '{}': {}", key, e))
                }
            })?;

        tracing::debug!(key = %key, "S3 streamed download successful");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);

        match self.bucket.head_object(&full_key).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(AppError::Destination(format!(
                "Failed to check existence of '{}': {}",
                key, e
            ))),
        }
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let full_key = self.full_key(key);

        let (head, _) = self.bucket.head_object(&full_key).await.map_err(|e| {
            if is_not_found(&e) {
                AppError::NotFound(format!("Storage key not found: {}", key))
            } else {
                AppError::Destination(format!("Failed to get size of '{}': {}", key, e))
            }
        })?;

        let size = head.content_length.unwrap_or(0).max(0) as u64;
        tracing::debug!(key = %key, size = size, "S3 head object successful");
        Ok(size)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let search_prefix = self.list_prefix(prefix);

        let results = self
            .bucket
            .list(search_prefix.clone(), Some("/".to_string()))
            .await
            .map_err(|e| AppError::Destination(format!("Failed to list objects: {}", e)))?;

        let dir = normalize_dir(prefix);
        let mut keys: Vec<String> = results
            .into_iter()
            .flat_map(|result| result.contents)
            .filter(|obj| obj.key.len() > search_prefix.len())
            .map(|obj| self.strip_prefix(&obj.key))
            .filter(|key| {
                let name = key.strip_prefix(dir).unwrap_or(key).trim_start_matches('/');
                !name.is_empty() && !name.contains('/')
            })
            .map(|key| join_key(dir, super::key_name(&key)))
            .collect();
        keys.sort();

        tracing::debug!(prefix = %prefix, count = keys.len(), "S3 list objects successful");
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key);

        match self.bucket.delete_object(&full_key).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                return Err(AppError::Destination(format!(
                    "Failed to delete object '{}': {}",
                    key, e
                )))
            }
        }

        tracing::debug!(key = %key, "S3 delete object successful");
        Ok(())
    }
}
