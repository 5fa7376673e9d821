//! Database connection setup.

use crate::config::{Config, DatabaseConfig};
use crate::error::{AppError, Result};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Create the record store connection pool and apply migrations
pub async fn create_records_pool(options: MySqlConnectOptions) -> Result<MySqlPool> {
    let pool = MySqlPoolOptions::new()
        .max_connections(5)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Where the record store lives.
///
/// `BACKUP_RECORDS_URL` wins. Otherwise a MySQL application database is
/// shared, connected with its own fields so credentials are never spliced
/// into a URL.
pub fn records_connect_options(config: &Config) -> Result<MySqlConnectOptions> {
    if let Some(url) = config.records_database_url.as_deref() {
        return MySqlConnectOptions::from_str(url)
            .map_err(|e| AppError::Config(format!("BACKUP_RECORDS_URL is invalid: {}", e)));
    }
    if config.database.is_mysql() {
        return Ok(app_connect_options(
            &config.database,
            &config.dump.default_character_set,
        ));
    }
    Err(AppError::Config(
        "BACKUP_RECORDS_URL is not set and the application database is not MySQL".into(),
    ))
}

/// Connect options for the live application database.
///
/// Dumps hold a single connection for their whole duration, so no pool tuning applies.
pub fn app_connect_options(config: &DatabaseConfig, charset: &str) -> MySqlConnectOptions {
    let mut options = MySqlConnectOptions::new()
        .host(&config.host)
        .port(config.port_or_default())
        .username(&config.username)
        .database(&config.database)
        .charset(charset);

    if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
        options = options.password(password);
    }
    if let Some(socket) = &config.unix_socket {
        options = options.socket(socket);
    }
    options
}
