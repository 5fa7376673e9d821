//! Command-line interface for backup-keeper.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::error::AppError;

/// Point-in-time backups of the application database and storage tree
#[derive(Parser, Debug)]
#[command(name = "backup-keeper", version)]
#[command(about = "Create, list, prune and restore application backups", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run backups for every enabled provider that is due
    Run {
        /// Ignore the provider frequency and back up now
        #[arg(long)]
        force: bool,

        /// Only consider this provider
        #[arg(long)]
        provider: Option<i64>,
    },

    /// Take a manual backup on one provider
    Backup {
        #[arg(long)]
        provider: i64,

        /// Include the database dump
        #[arg(long)]
        database: bool,

        /// Include the storage archive
        #[arg(long)]
        storage: bool,
    },

    /// List stored backups, newest first
    List {
        #[arg(long)]
        provider: Option<i64>,
    },

    /// Download a backup archive to a local path
    Download { identifier: String, path: PathBuf },

    /// Delete a backup and its run log entries
    Delete { identifier: String },

    /// Restore a backup into the live database and/or storage tree
    Restore {
        identifier: String,

        #[command(flatten)]
        scope: RestoreScopeArgs,

        /// Confirm that the live storage tree may be replaced
        #[arg(long)]
        yes: bool,
    },

    /// Manage backup providers
    Provider {
        #[command(subcommand)]
        command: ProviderCommand,
    },

    /// Show recent backup runs
    Logs {
        #[arg(long)]
        provider: Option<i64>,

        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Mark runs stuck in `running` as failed
    Reconcile {
        #[arg(long, default_value = "6")]
        older_than_hours: i64,
    },

    /// Run the scheduler until interrupted
    Daemon,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct RestoreScopeArgs {
    #[arg(long)]
    pub database: bool,

    #[arg(long)]
    pub storage: bool,

    #[arg(long)]
    pub all: bool,
}

#[derive(Subcommand, Debug)]
pub enum ProviderCommand {
    /// Register a new provider
    Add {
        #[arg(long)]
        name: String,

        /// local, ftp, sftp, s3 or google
        #[arg(long)]
        driver: String,

        /// Driver configuration as a JSON object
        #[arg(long, default_value = "{}")]
        config: String,

        #[arg(long, default_value = "24")]
        frequency_hours: i32,

        #[arg(long, default_value = "7")]
        retention_days: i32,

        /// Register the provider disabled
        #[arg(long)]
        disabled: bool,
    },

    /// List providers
    List,
}

/// Print a result: `message` as text, `value` as JSON.
pub fn output(format: OutputFormat, message: &str, value: serde_json::Value) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
        }
        OutputFormat::Text => println!("{}", message),
    }
}

/// Print an error to stderr
pub fn error(format: OutputFormat, err: &AppError) {
    match format {
        OutputFormat::Json => {
            let body = serde_json::json!({ "error": err.to_string(), "code": err.code() });
            eprintln!("{}", body);
        }
        OutputFormat::Text => eprintln!("Error: {}", err),
    }
}

pub fn table_row(cells: &[&str]) {
    println!("{}", cells.join("\t"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["backup-keeper", "run", "--force", "--provider", "3"]).unwrap();
        match cli.command {
            Command::Run { force, provider } => {
                assert!(force);
                assert_eq!(provider, Some(3));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cli.format, OutputFormat::Text);
    }

    #[test]
    fn test_restore_requires_exactly_one_scope() {
        assert!(Cli::try_parse_from(["backup-keeper", "restore", "abc"]).is_err());
        assert!(
            Cli::try_parse_from(["backup-keeper", "restore", "abc", "--database", "--storage"]).is_err()
        );
        let cli = Cli::try_parse_from(["backup-keeper", "--format", "json", "restore", "abc", "--all", "--yes"])
            .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Command::Restore { yes: true, .. }));
    }

    #[test]
    fn test_backup_requires_provider() {
        assert!(Cli::try_parse_from(["backup-keeper", "backup", "--database"]).is_err());
    }
}
