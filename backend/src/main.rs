//! Backup Keeper - Main Entry Point

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use backup_keeper::{
    cli::{self, commands, Cli},
    config::Config,
    telemetry,
};

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            commands::error(cli.format, &e);
            return ExitCode::from(2);
        }
    };

    let _otel_guard = telemetry::init_tracing(config.otel_endpoint.as_deref(), cli.verbose);

    let records = match cli::open_records(&config).await {
        Ok(records) => records,
        Err(e) => {
            tracing::error!(error_code = e.code(), "Failed to open record store: {}", e);
            commands::error(cli.format, &e);
            return ExitCode::from(2);
        }
    };

    match cli::execute(cli.command, cli.format, config, records).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            commands::error(cli.format, &e);
            ExitCode::FAILURE
        }
    }
}
