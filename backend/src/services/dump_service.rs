//! Database export.
//!
//! MySQL and MariaDB are dumped in-process over a single connection, rows
//! streamed from the server through the text protocol. PostgreSQL goes
//! through `pg_dump`; SQLite is a copy of the database file.

use chrono::Utc;
use futures::TryStreamExt;
use sqlx::mysql::{MySqlConnection, MySqlRow};
use sqlx::{ConnectOptions, Executor, Row};
use std::path::Path;
use tokio::io::{AsyncWrite, BufWriter};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::db::app_connect_options;
use crate::error::{AppError, Result};
use crate::services::db_client;
use crate::services::dump_writer::{quote_identifier, ColumnKind, DumpColumn, DumpOptions, DumpWriter};

/// Exports the live application database to a SQL file.
pub struct DumpService {
    database: DatabaseConfig,
    options: DumpOptions,
}

impl DumpService {
    pub fn new(database: DatabaseConfig, options: DumpOptions) -> Self {
        Self { database, options }
    }

    /// Write a dump of the configured database to `target`.
    pub async fn dump_to(&self, target: &Path) -> Result<()> {
        match self.database.driver.as_str() {
            "mysql" | "mariadb" => self.dump_mysql(target).await,
            "pgsql" | "postgres" => {
                db_client::run(&db_client::pg_dump(&self.database, target), None).await
            }
            "sqlite" => {
                tokio::fs::copy(&self.database.database, target).await?;
                Ok(())
            }
            other => Err(AppError::unsupported_driver(other)),
        }
    }

    async fn dump_mysql(&self, target: &Path) -> Result<()> {
        let options = app_connect_options(&self.database, &self.options.default_character_set);
        let mut conn = options.connect().await?;

        let file = tokio::fs::File::create(target).await?;
        let bytes = dump_mysql_connection(
            &mut conn,
            &self.database.host,
            &self.database.database,
            &self.options,
            BufWriter::new(file),
        )
        .await?;

        info!(
            database = %self.database.database,
            bytes,
            "MySQL dump written"
        );
        Ok(())
    }
}

/// Catalog snapshot gathered before any data is read.
#[derive(Debug, Default)]
struct Catalog {
    tables: Vec<String>,
    views: Vec<String>,
    triggers: Vec<String>,
}

fn text(row: &MySqlRow, column: &str) -> Result<String> {
    let raw: Option<Vec<u8>> = row.try_get_unchecked(column)?;
    Ok(raw
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default())
}

fn text_at(row: &MySqlRow, index: usize) -> Result<String> {
    let raw: Option<Vec<u8>> = row.try_get_unchecked(index)?;
    Ok(raw
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default())
}

async fn read_catalog(conn: &mut MySqlConnection, options: &DumpOptions) -> Result<Catalog> {
    let mut catalog = Catalog::default();

    let rows = (&mut *conn)
        .fetch_all(
            "SELECT TABLE_NAME, TABLE_TYPE FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() ORDER BY TABLE_NAME",
        )
        .await?;
    for row in &rows {
        let name = text_at(row, 0)?;
        match text_at(row, 1)?.as_str() {
            "BASE TABLE" if options.wants_table(&name) => catalog.tables.push(name),
            "VIEW" => catalog.views.push(name),
            _ => {}
        }
    }

    if !options.skip_triggers {
        for row in &(&mut *conn).fetch_all("SHOW TRIGGERS").await? {
            if options.wants_table(&text(row, "Table")?) {
                catalog.triggers.push(text(row, "Trigger")?);
            }
        }
    }

    Ok(catalog)
}

async fn read_columns(conn: &mut MySqlConnection, table: &str) -> Result<Vec<DumpColumn>> {
    let sql = format!("SHOW COLUMNS FROM {}", quote_identifier(table));
    (&mut *conn)
        .fetch_all(sql.as_str())
        .await?
        .iter()
        .map(|row| {
            Ok(DumpColumn {
                name: text(row, "Field")?,
                kind: ColumnKind::classify(&text(row, "Type")?),
            })
        })
        .collect()
}

async fn show_create(conn: &mut MySqlConnection, kind: &str, name: &str) -> Result<Option<String>> {
    let sql = format!("SHOW CREATE {} {}", kind, quote_identifier(name));
    let column = match kind {
        "TABLE" => "Create Table",
        "VIEW" => "Create View",
        _ => "SQL Original Statement",
    };
    match (&mut *conn).fetch_optional(sql.as_str()).await? {
        Some(row) => Ok(Some(text(&row, column)?)),
        None => Ok(None),
    }
}

/// Stream a full dump of the connection's current database into `sink`.
///
/// Returns the number of bytes written. On error the sink holds partial
/// output that the caller must discard.
pub async fn dump_mysql_connection<W>(
    conn: &mut MySqlConnection,
    host: &str,
    database: &str,
    options: &DumpOptions,
    sink: W,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let set_names = format!("SET NAMES {}", options.default_character_set);
    (&mut *conn).execute(set_names.as_str()).await?;
    let version: String = sqlx::query_scalar("SELECT VERSION()")
        .fetch_one(&mut *conn)
        .await?;

    let catalog = read_catalog(conn, options).await?;
    debug!(
        tables = catalog.tables.len(),
        views = catalog.views.len(),
        triggers = catalog.triggers.len(),
        "Read database catalog"
    );

    let mut writer = DumpWriter::new(sink, options.clone());
    writer.header(host, database, &version, Utc::now()).await?;
    writer.prologue().await?;

    let mut snapshot_open = false;
    for table in &catalog.tables {
        if let Some(ddl) = show_create(conn, "TABLE", table).await? {
            writer.table_structure(table, &ddl).await?;
        }

        let columns = read_columns(conn, table).await?;
        if columns.is_empty() {
            warn!(table = %table, "Table has no columns, dumping structure only");
            continue;
        }

        if options.single_transaction && !snapshot_open {
            (&mut *conn)
                .execute("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
                .await?;
            (&mut *conn)
                .execute("START TRANSACTION WITH CONSISTENT SNAPSHOT")
                .await?;
            snapshot_open = true;
        }

        let select = format!(
            "SELECT {} FROM {}",
            columns
                .iter()
                .map(|c| quote_identifier(&c.name))
                .collect::<Vec<_>>()
                .join(","),
            quote_identifier(table)
        );

        writer.begin_table_data(table).await?;
        let mut row_count: u64 = 0;
        {
            let mut rows = (&mut *conn).fetch(select.as_str());
            while let Some(row) = rows.try_next().await? {
                let values = (0..columns.len())
                    .map(|i| row.try_get_unchecked::<Option<Vec<u8>>, _>(i))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                writer.write_row(table, &columns, &values).await?;
                row_count += 1;
            }
        }
        writer.end_table_data(table).await?;
        debug!(table = %table, rows = row_count, "Dumped table data");
    }

    if snapshot_open {
        (&mut *conn).execute("COMMIT").await?;
    }

    for trigger in &catalog.triggers {
        if let Some(statement) = show_create(conn, "TRIGGER", trigger).await? {
            writer.trigger(trigger, &statement).await?;
        }
    }

    for view in &catalog.views {
        if let Some(ddl) = show_create(conn, "VIEW", view).await? {
            writer.view(view, &ddl).await?;
        }
    }

    writer.epilogue().await?;
    writer.footer(Utc::now()).await?;
    writer.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(driver: &str, database: &str) -> DatabaseConfig {
        DatabaseConfig {
            connection: driver.into(),
            driver: driver.into(),
            database: database.into(),
            ..DatabaseConfig::default()
        }
    }

    #[tokio::test]
    async fn test_unsupported_driver() {
        let dir = tempfile::tempdir().unwrap();
        let service = DumpService::new(config("oracle", "app"), DumpOptions::default());
        let err = service
            .dump_to(&dir.path().join("database.sql"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(err.to_string().contains("[oracle]"));
    }

    #[tokio::test]
    async fn test_sqlite_copies_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_file = dir.path().join("app.sqlite");
        std::fs::write(&db_file, b"SQLite format 3\0fixture").unwrap();

        let service = DumpService::new(
            config("sqlite", db_file.to_str().unwrap()),
            DumpOptions::default(),
        );
        let target = dir.path().join("database.sql");
        service.dump_to(&target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"SQLite format 3\0fixture");
    }

    #[tokio::test]
    async fn test_sqlite_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let service = DumpService::new(
            config("sqlite", dir.path().join("missing.sqlite").to_str().unwrap()),
            DumpOptions::default(),
        );
        assert!(service.dump_to(&dir.path().join("out.sql")).await.is_err());
    }
}
