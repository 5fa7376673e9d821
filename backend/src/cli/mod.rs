//! CLI modules for backup-keeper.

pub mod commands;
pub mod runner;

pub use commands::{Cli, Command, OutputFormat};
pub use runner::{execute, open_records};
