//! Backup Keeper - Backend Library
//!
//! Point-in-time backups of an application database and its file storage
//! tree, shipped to local, FTP, SFTP, S3 and Google Drive destinations.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
