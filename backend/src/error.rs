//! Application error types and result alias.

use thiserror::Error;

use crate::services::encryption::EncryptionError;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error (unsupported driver, missing backend client, bad provider config)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller asked for something that cannot be done as requested
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No stored artifact matches the identifier
    #[error("Backup not found: {0}")]
    ArtifactNotFound(String),

    /// An expected file is absent inside an extracted backup
    #[error("{0}")]
    MissingArtifact(String),

    /// Archive could not be created, opened or extracted
    #[error("Archive error: {0}")]
    Archive(String),

    /// Export/import failure, including external client processes
    #[error("Database error: {0}")]
    Database(String),

    /// Storage destination unreachable or rejected a read/write
    #[error("Destination error: {0}")]
    Destination(String),

    /// Record lookup failed (provider, run log)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Another run for the same provider is in progress
    #[error("Conflict: {0}")]
    Conflict(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Provider configuration could not be encrypted or decrypted
    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),
}

impl AppError {
    pub fn unsupported_driver(driver: &str) -> Self {
        AppError::Config(format!(
            "Unsupported database driver [{}] for backup operations.",
            driver
        ))
    }

    pub fn missing_artifact(name: &str) -> Self {
        AppError::MissingArtifact(format!(
            "Required backup artifact [{}] was not found inside the archive.",
            name
        ))
    }

    /// Stable machine-readable code, used by the JSON output of the CLI.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::ArtifactNotFound(_) => "ARTIFACT_NOT_FOUND",
            AppError::MissingArtifact(_) => "MISSING_ARTIFACT",
            AppError::Archive(_) => "ARCHIVE_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Destination(_) => "DESTINATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Io(_) => "IO_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::Encryption(_) => "ENCRYPTION_ERROR",
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        AppError::Database(format!("migration failed: {}", e))
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(e: zip::result::ZipError) -> Self {
        AppError::Archive(e.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        AppError::Io(std::io::Error::other(e))
    }
}
