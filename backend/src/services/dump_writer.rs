//! SQL text emitter for the MySQL dump engine.
//!
//! Everything here is independent of a live connection: the dump service
//! feeds catalog data and rows in, this module decides what bytes go out.

use chrono::{DateTime, Utc};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;

/// Options that shape the emitted SQL.
#[derive(Debug, Clone)]
pub struct DumpOptions {
    /// When non-empty, only these tables are dumped
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub add_drop_table: bool,
    pub add_drop_trigger: bool,
    pub add_locks: bool,
    pub disable_keys: bool,
    pub extended_insert: bool,
    pub hex_blob: bool,
    pub insert_ignore: bool,
    pub single_transaction: bool,
    pub no_create_info: bool,
    pub skip_triggers: bool,
    pub skip_comments: bool,
    pub default_character_set: String,
    /// Soft cap on the length of one extended INSERT statement
    pub net_buffer_length: usize,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            include_tables: Vec::new(),
            exclude_tables: vec!["cron_logs".into(), "logs".into()],
            add_drop_table: false,
            add_drop_trigger: true,
            add_locks: true,
            disable_keys: true,
            extended_insert: true,
            hex_blob: true,
            insert_ignore: false,
            single_transaction: true,
            no_create_info: false,
            skip_triggers: false,
            skip_comments: false,
            default_character_set: "utf8mb4".into(),
            net_buffer_length: 1_000_000,
        }
    }
}

impl DumpOptions {
    /// Whether a base table takes part in the dump.
    pub fn wants_table(&self, table: &str) -> bool {
        if self.exclude_tables.iter().any(|t| t == table) {
            return false;
        }
        self.include_tables.is_empty() || self.include_tables.iter().any(|t| t == table)
    }
}

const NUMERIC_PREFIXES: &[&str] = &[
    "int", "tinyint", "smallint", "mediumint", "bigint", "float", "double", "decimal", "numeric",
    "bit",
];
const BLOB_PREFIXES: &[&str] = &[
    "blob", "tinyblob", "mediumblob", "longblob", "binary", "varbinary",
];

/// Escaping class of a column, derived from its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Numeric,
    Blob,
    Other,
}

impl ColumnKind {
    /// Classify by prefix of the declared type (`int(11) unsigned`, `varbinary(16)`, ...).
    pub fn classify(declared_type: &str) -> Self {
        let ty = declared_type.trim().to_ascii_lowercase();
        if NUMERIC_PREFIXES.iter().any(|p| ty.starts_with(p)) {
            ColumnKind::Numeric
        } else if BLOB_PREFIXES.iter().any(|p| ty.starts_with(p)) {
            ColumnKind::Blob
        } else {
            ColumnKind::Other
        }
    }
}

/// A column as the emitter needs it.
#[derive(Debug, Clone)]
pub struct DumpColumn {
    pub name: String,
    pub kind: ColumnKind,
}

/// Backtick-quote an identifier.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote bytes as a MySQL string literal.
pub fn quote_mysql(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 2);
    out.push(b'\'');
    for &b in raw {
        match b {
            0 => out.extend_from_slice(b"\\0"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\'' => out.extend_from_slice(b"\\'"),
            b'"' => out.extend_from_slice(b"\\\""),
            0x1a => out.extend_from_slice(b"\\Z"),
            _ => out.push(b),
        }
    }
    out.push(b'\'');
    out
}

/// Render one value for a VALUES tuple.
///
/// NULL wins over every other rule; non-empty blobs become hex when
/// `hex_blob` is on; numerics are emitted verbatim; the rest is quoted.
pub fn escape_value(value: Option<&[u8]>, kind: ColumnKind, hex_blob: bool) -> Vec<u8> {
    let Some(raw) = value else {
        return b"NULL".to_vec();
    };
    match kind {
        ColumnKind::Blob if hex_blob && !raw.is_empty() => {
            let mut out = Vec::with_capacity(2 + raw.len() * 2);
            out.extend_from_slice(b"0x");
            for b in raw {
                out.extend_from_slice(format!("{:02x}", b).as_bytes());
            }
            out
        }
        ColumnKind::Numeric if !raw.is_empty() => raw.to_vec(),
        _ => quote_mysql(raw),
    }
}

/// Streams dump statements into an async sink.
pub struct DumpWriter<W> {
    sink: W,
    options: DumpOptions,
    bytes_written: u64,
    /// Length of the INSERT statement currently open, if any
    open_statement: Option<usize>,
}

impl<W: AsyncWrite + Unpin> DumpWriter<W> {
    pub fn new(sink: W, options: DumpOptions) -> Self {
        Self {
            sink,
            options,
            bytes_written: 0,
            open_statement: None,
        }
    }

    pub fn options(&self) -> &DumpOptions {
        &self.options
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.sink.write_all(data).await?;
        self.bytes_written += data.len() as u64;
        Ok(data.len())
    }

    async fn write_str(&mut self, data: &str) -> Result<usize> {
        self.write(data.as_bytes()).await
    }

    pub async fn header(
        &mut self,
        host: &str,
        database: &str,
        server_version: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if self.options.skip_comments {
            return Ok(());
        }
        let header = format!(
            "-- Database Backup\n-- Host: {}\tDatabase: {}\n-- Server version: {}\n-- Date: {}\n\n",
            host,
            database,
            server_version,
            at.to_rfc2822()
        );
        self.write_str(&header).await?;
        Ok(())
    }

    /// Save session parameters and relax checks for the import.
    pub async fn prologue(&mut self) -> Result<()> {
        let prologue = format!(
            "/*!40101 SET @OLD_CHARACTER_SET_CLIENT=@@CHARACTER_SET_CLIENT */;\n\
             /*!40101 SET @OLD_CHARACTER_SET_RESULTS=@@CHARACTER_SET_RESULTS */;\n\
             /*!40101 SET @OLD_COLLATION_CONNECTION=@@COLLATION_CONNECTION */;\n\
             /*!40101 SET NAMES {} */;\n\
             /*!40014 SET @OLD_UNIQUE_CHECKS=@@UNIQUE_CHECKS, UNIQUE_CHECKS=0 */;\n\
             /*!40014 SET @OLD_FOREIGN_KEY_CHECKS=@@FOREIGN_KEY_CHECKS, FOREIGN_KEY_CHECKS=0 */;\n\
             /*!40101 SET @OLD_SQL_MODE=@@SQL_MODE, SQL_MODE='NO_AUTO_VALUE_ON_ZERO' */;\n\n",
            self.options.default_character_set
        );
        self.write_str(&prologue).await?;
        Ok(())
    }

    pub async fn epilogue(&mut self) -> Result<()> {
        self.write_str(
            "/*!40101 SET SQL_MODE=@OLD_SQL_MODE */;\n\
             /*!40014 SET FOREIGN_KEY_CHECKS=@OLD_FOREIGN_KEY_CHECKS */;\n\
             /*!40014 SET UNIQUE_CHECKS=@OLD_UNIQUE_CHECKS */;\n\
             /*!40101 SET CHARACTER_SET_CLIENT=@OLD_CHARACTER_SET_CLIENT */;\n\
             /*!40101 SET CHARACTER_SET_RESULTS=@OLD_CHARACTER_SET_RESULTS */;\n\
             /*!40101 SET COLLATION_CONNECTION=@OLD_COLLATION_CONNECTION */;\n\n",
        )
        .await?;
        Ok(())
    }

    pub async fn footer(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.options.skip_comments {
            return Ok(());
        }
        let footer = format!("-- Dump completed on: {}\n", at.to_rfc2822());
        self.write_str(&footer).await?;
        Ok(())
    }

    /// Emit the DDL of a base table. No-op with `no_create_info`.
    pub async fn table_structure(&mut self, table: &str, create_sql: &str) -> Result<()> {
        if self.options.no_create_info {
            return Ok(());
        }
        let name = quote_identifier(table);
        if !self.options.skip_comments {
            let comment = format!("\n--\n-- Table structure for table {}\n--\n\n", name);
            self.write_str(&comment).await?;
        }
        if self.options.add_drop_table {
            let drop = format!("DROP TABLE IF EXISTS {};\n", name);
            self.write_str(&drop).await?;
        }
        self.write_str(&format!("{};\n\n", create_sql)).await?;
        Ok(())
    }

    /// Open the data section of a table (comment, lock and key brackets).
    pub async fn begin_table_data(&mut self, table: &str) -> Result<()> {
        let name = quote_identifier(table);
        if !self.options.skip_comments {
            let comment = format!("--\n-- Dumping data for table {}\n--\n\n", name);
            self.write_str(&comment).await?;
        }
        if self.options.add_locks {
            self.write_str(&format!("LOCK TABLES {} WRITE;\n", name)).await?;
        }
        if self.options.disable_keys {
            let stmt = format!("/*!40000 ALTER TABLE {} DISABLE KEYS */;\n", name);
            self.write_str(&stmt).await?;
        }
        self.open_statement = None;
        Ok(())
    }

    /// Append one row. `values` are positionally aligned with `columns`.
    pub async fn write_row(
        &mut self,
        table: &str,
        columns: &[DumpColumn],
        values: &[Option<Vec<u8>>],
    ) -> Result<()> {
        let mut tuple = Vec::with_capacity(64);
        tuple.push(b'(');
        for (i, (column, value)) in columns.iter().zip(values).enumerate() {
            if i > 0 {
                tuple.push(b',');
            }
            tuple.extend(escape_value(
                value.as_deref(),
                column.kind,
                self.options.hex_blob,
            ));
        }
        tuple.push(b')');

        let mut line_size = match self.open_statement {
            Some(size) if self.options.extended_insert => {
                self.write(b",").await?;
                size + 1
            }
            _ => {
                let ignore = if self.options.insert_ignore { " IGNORE" } else { "" };
                let prefix = format!("INSERT{} INTO {} VALUES ", ignore, quote_identifier(table));
                self.write_str(&prefix).await?
            }
        };
        line_size += self.write(&tuple).await?;

        if !self.options.extended_insert || line_size > self.options.net_buffer_length {
            self.write(b";\n").await?;
            self.open_statement = None;
        } else {
            self.open_statement = Some(line_size);
        }
        Ok(())
    }

    /// Close any pending INSERT and the brackets opened by `begin_table_data`.
    pub async fn end_table_data(&mut self, table: &str) -> Result<()> {
        if self.open_statement.take().is_some() {
            self.write(b";\n").await?;
        }
        let name = quote_identifier(table);
        if self.options.disable_keys {
            let stmt = format!("/*!40000 ALTER TABLE {} ENABLE KEYS */;\n", name);
            self.write_str(&stmt).await?;
        }
        if self.options.add_locks {
            self.write_str("UNLOCK TABLES;\n").await?;
        }
        self.write(b"\n").await?;
        Ok(())
    }

    pub async fn view(&mut self, view: &str, create_sql: &str) -> Result<()> {
        let name = quote_identifier(view);
        if !self.options.skip_comments {
            let comment = format!("\n--\n-- View structure for {}\n--\n\n", name);
            self.write_str(&comment).await?;
        }
        self.write_str(&format!("DROP VIEW IF EXISTS {};\n", name))
            .await?;
        self.write_str(&format!("{};\n\n", create_sql)).await?;
        Ok(())
    }

    pub async fn trigger(&mut self, trigger: &str, statement: &str) -> Result<()> {
        if self.options.add_drop_trigger {
            let drop = format!("DROP TRIGGER IF EXISTS {};\n", quote_identifier(trigger));
            self.write_str(&drop).await?;
        }
        let body = format!("DELIMITER ;;\n{};;\nDELIMITER ;\n\n", statement);
        self.write_str(&body).await?;
        Ok(())
    }

    /// Flush the sink and return the total number of bytes emitted.
    pub async fn finish(mut self) -> Result<u64> {
        self.sink.flush().await?;
        Ok(self.bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    fn columns() -> Vec<DumpColumn> {
        vec![
            DumpColumn {
                name: "id".into(),
                kind: ColumnKind::Numeric,
            },
            DumpColumn {
                name: "name".into(),
                kind: ColumnKind::Other,
            },
        ]
    }

    fn row(id: &str, name: &str) -> Vec<Option<Vec<u8>>> {
        vec![Some(id.as_bytes().to_vec()), Some(name.as_bytes().to_vec())]
    }

    async fn render(options: DumpOptions, rows: &[Vec<Option<Vec<u8>>>]) -> String {
        let mut writer = DumpWriter::new(Vec::new(), options);
        writer.begin_table_data("users").await.unwrap();
        for r in rows {
            writer.write_row("users", &columns(), r).await.unwrap();
        }
        writer.end_table_data("users").await.unwrap();
        let DumpWriter { sink, .. } = writer;
        text(sink)
    }

    #[test]
    fn test_classify_columns() {
        assert_eq!(ColumnKind::classify("int(11) unsigned"), ColumnKind::Numeric);
        assert_eq!(ColumnKind::classify("DECIMAL(10,2)"), ColumnKind::Numeric);
        assert_eq!(ColumnKind::classify("bit(1)"), ColumnKind::Numeric);
        assert_eq!(ColumnKind::classify("varbinary(16)"), ColumnKind::Blob);
        assert_eq!(ColumnKind::classify("longblob"), ColumnKind::Blob);
        assert_eq!(ColumnKind::classify("varchar(255)"), ColumnKind::Other);
        assert_eq!(ColumnKind::classify("datetime"), ColumnKind::Other);
    }

    #[test]
    fn test_escape_blob_as_hex() {
        let value = [0xDE, 0xAD, 0xBE, 0xEF];
        assert_eq!(
            text(escape_value(Some(&value), ColumnKind::Blob, true)),
            "0xdeadbeef"
        );
    }

    #[test]
    fn test_escape_null_for_any_kind() {
        for kind in [ColumnKind::Numeric, ColumnKind::Blob, ColumnKind::Other] {
            assert_eq!(text(escape_value(None, kind, true)), "NULL");
        }
    }

    #[test]
    fn test_escape_numeric_verbatim() {
        assert_eq!(text(escape_value(Some(b"42"), ColumnKind::Numeric, true)), "42");
    }

    #[test]
    fn test_escape_text_quoted() {
        assert_eq!(
            text(escape_value(Some(b"O'Brien"), ColumnKind::Other, true)),
            "'O\\'Brien'"
        );
        assert_eq!(
            text(escape_value(Some(b"a\nb\\c\0"), ColumnKind::Other, true)),
            "'a\\nb\\\\c\\0'"
        );
    }

    #[test]
    fn test_escape_empty_blob_and_hex_off() {
        assert_eq!(text(escape_value(Some(b""), ColumnKind::Blob, true)), "''");
        assert_eq!(text(escape_value(Some(b"ab"), ColumnKind::Blob, false)), "'ab'");
    }

    #[test]
    fn test_quote_identifier_doubles_backticks() {
        assert_eq!(quote_identifier("odd`name"), "`odd``name`");
    }

    #[test]
    fn test_wants_table() {
        let mut options = DumpOptions::default();
        assert!(options.wants_table("users"));
        assert!(!options.wants_table("logs"));
        assert!(!options.wants_table("cron_logs"));
        options.include_tables = vec!["orders".into()];
        assert!(!options.wants_table("users"));
        assert!(options.wants_table("orders"));
    }

    #[tokio::test]
    async fn test_extended_insert_batches_rows() {
        let out = render(
            DumpOptions {
                skip_comments: true,
                ..DumpOptions::default()
            },
            &[row("1", "a"), row("2", "b")],
        )
        .await;
        assert_eq!(
            out,
            "LOCK TABLES `users` WRITE;\n\
             /*!40000 ALTER TABLE `users` DISABLE KEYS */;\n\
             INSERT INTO `users` VALUES (1,'a'),(2,'b');\n\
             /*!40000 ALTER TABLE `users` ENABLE KEYS */;\n\
             UNLOCK TABLES;\n\n"
        );
    }

    #[tokio::test]
    async fn test_single_row_inserts() {
        let out = render(
            DumpOptions {
                skip_comments: true,
                extended_insert: false,
                add_locks: false,
                disable_keys: false,
                insert_ignore: true,
                ..DumpOptions::default()
            },
            &[row("1", "a"), row("2", "b")],
        )
        .await;
        assert_eq!(
            out,
            "INSERT IGNORE INTO `users` VALUES (1,'a');\n\
             INSERT IGNORE INTO `users` VALUES (2,'b');\n\n"
        );
    }

    #[tokio::test]
    async fn test_buffer_cap_splits_statements() {
        let out = render(
            DumpOptions {
                skip_comments: true,
                add_locks: false,
                disable_keys: false,
                net_buffer_length: 40,
                ..DumpOptions::default()
            },
            &[row("1", "a"), row("2", "b"), row("3", "c")],
        )
        .await;
        let inserts = out.matches("INSERT INTO").count();
        assert!(inserts >= 2, "expected split statements, got: {}", out);
        assert_eq!(out.matches(";\n").count(), inserts);
        for value in ["(1,'a')", "(2,'b')", "(3,'c')"] {
            assert!(out.contains(value));
        }
    }

    #[tokio::test]
    async fn test_empty_table_keeps_brackets() {
        let out = render(
            DumpOptions {
                skip_comments: true,
                ..DumpOptions::default()
            },
            &[],
        )
        .await;
        assert!(!out.contains("INSERT"));
        assert!(out.contains("LOCK TABLES `users` WRITE;"));
        assert!(out.contains("DISABLE KEYS"));
        assert!(out.contains("ENABLE KEYS"));
        assert!(out.contains("UNLOCK TABLES;"));
    }

    #[tokio::test]
    async fn test_header_prologue_and_trigger() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        let mut writer = DumpWriter::new(Vec::new(), DumpOptions::default());
        writer.header("db.local", "app", "8.0.36", at).await.unwrap();
        writer.prologue().await.unwrap();
        writer
            .trigger("audit", "CREATE TRIGGER audit AFTER INSERT ON users FOR EACH ROW SET @x = 1")
            .await
            .unwrap();
        writer.view("active_users", "CREATE VIEW active_users AS SELECT 1").await.unwrap();
        writer.epilogue().await.unwrap();
        writer.footer(at).await.unwrap();
        let DumpWriter { sink, .. } = writer;
        let out = text(sink);

        assert!(out.starts_with("-- Database Backup\n-- Host: db.local\tDatabase: app\n"));
        assert!(out.contains("-- Server version: 8.0.36\n"));
        assert!(out.contains("/*!40101 SET NAMES utf8mb4 */;"));
        assert!(out.contains("DROP TRIGGER IF EXISTS `audit`;\nDELIMITER ;;\nCREATE TRIGGER"));
        assert!(out.contains(";;\nDELIMITER ;\n\n"));
        assert!(out.contains("DROP VIEW IF EXISTS `active_users`;\nCREATE VIEW"));
        assert!(out.contains("/*!40101 SET SQL_MODE=@OLD_SQL_MODE */;"));
        assert!(out.trim_end().ends_with("+0000"));
    }

    #[tokio::test]
    async fn test_skip_comments_and_no_create_info() {
        let mut writer = DumpWriter::new(
            Vec::new(),
            DumpOptions {
                skip_comments: true,
                no_create_info: true,
                ..DumpOptions::default()
            },
        );
        writer.header("h", "d", "v", Utc::now()).await.unwrap();
        writer.table_structure("users", "CREATE TABLE `users` (id int)").await.unwrap();
        writer.footer(Utc::now()).await.unwrap();
        assert_eq!(writer.finish().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_table_structure_with_drop() {
        let mut writer = DumpWriter::new(
            Vec::new(),
            DumpOptions {
                add_drop_table: true,
                ..DumpOptions::default()
            },
        );
        writer.table_structure("users", "CREATE TABLE `users` (id int)").await.unwrap();
        let DumpWriter { sink, .. } = writer;
        let out = text(sink);
        assert!(out.contains("-- Table structure for table `users`"));
        assert!(out.contains("DROP TABLE IF EXISTS `users`;\nCREATE TABLE `users` (id int);\n\n"));
    }
}
