//! Invocation of the engines' command-line clients (`mysql`, `psql`, `pg_dump`).
//!
//! Passwords travel through the child's environment only, never argv.

use std::path::Path;
use std::process::Stdio;

use crate::config::DatabaseConfig;
use crate::error::{AppError, Result};

/// A fully described client invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ClientCommand {
    fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn password_env(mut self, var: &str, password: Option<&str>) -> Self {
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            self.env.push((var.to_string(), password.to_string()));
        }
        self
    }
}

/// `mysql` client that replays a dump read from stdin.
pub fn mysql_import(config: &DatabaseConfig) -> ClientCommand {
    let mut cmd = ClientCommand::new("mysql")
        .arg(format!("--host={}", config.host))
        .arg(format!("--port={}", config.port_or_default()))
        .arg(format!("--user={}", config.username))
        .arg(config.database.clone());
    if let Some(socket) = config.unix_socket.as_deref().filter(|s| !s.is_empty()) {
        cmd = cmd.arg(format!("--socket={}", socket));
    }
    cmd.password_env("MYSQL_PWD", config.password.as_deref())
}

/// `psql` client that replays a dump read from stdin.
pub fn psql_import(config: &DatabaseConfig) -> ClientCommand {
    ClientCommand::new("psql")
        .arg(format!("--host={}", config.host))
        .arg(format!("--port={}", config.port_or_default()))
        .arg(format!("--username={}", config.username))
        .arg(format!("--dbname={}", config.database))
        .password_env("PGPASSWORD", config.password.as_deref())
}

/// `pg_dump` writing a plain SQL dump to `target`.
pub fn pg_dump(config: &DatabaseConfig, target: &Path) -> ClientCommand {
    ClientCommand::new("pg_dump")
        .arg(format!("--host={}", config.host))
        .arg(format!("--port={}", config.port_or_default()))
        .arg(format!("--username={}", config.username))
        .arg(format!("--dbname={}", config.database))
        .arg("--no-owner")
        .arg(format!("--file={}", target.display()))
        .password_env("PGPASSWORD", config.password.as_deref())
}

/// Run a client to completion, optionally feeding a file as stdin.
///
/// A missing binary is a configuration problem; a non-zero exit carries the
/// client's stderr.
pub async fn run(cmd: &ClientCommand, stdin_file: Option<&Path>) -> Result<()> {
    let mut command = tokio::process::Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    match stdin_file {
        Some(path) => {
            let file = std::fs::File::open(path)?;
            command.stdin(Stdio::from(file));
        }
        None => {
            command.stdin(Stdio::null());
        }
    }

    tracing::debug!(program = %cmd.program, args = ?cmd.args, "running database client");

    let output = command.output().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::Config(format!(
                "Database client [{}] is not installed or not on PATH",
                cmd.program
            ))
        } else {
            AppError::Database(format!("Failed to execute {}: {}", cmd.program, e))
        }
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Database(format!(
            "{} failed ({}): {}",
            cmd.program,
            output.status,
            stderr.trim()
        )));
    }

    Ok(())
}
