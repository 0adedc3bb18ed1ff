//! CLI probe for the NoteSync core.
//!
//! # Responsibility
//! - Verify `notesync_core` linkage with deterministic output.
//! - Validate a configuration file the way the application does at startup.

use clap::{Parser, Subcommand};
use log::{info, warn};
use notesync_core::{init_from_config, AppConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "notesync", version, about = "NoteSync core probe")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print ping and core version (default).
    Ping,
    /// Load a configuration file and print a redacted summary.
    CheckConfig {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Ping) {
        Command::Ping => {
            println!("notesync_core ping={}", notesync_core::ping());
            println!("notesync_core version={}", notesync_core::core_version());
            ExitCode::SUCCESS
        }
        Command::CheckConfig { path } => check_config(&path),
    }
}

fn check_config(path: &Path) -> ExitCode {
    let config = match AppConfig::load(path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config error: {err}");
            return ExitCode::FAILURE;
        }
    };

    match init_from_config(&config.logging) {
        Ok(true) => info!("event=config_check module=cli status=ok"),
        Ok(false) => {}
        Err(err) => {
            eprintln!("logging error: {err}");
            return ExitCode::FAILURE;
        }
    }

    let storage = config
        .storage
        .db_path
        .as_ref()
        .map_or_else(|| "memory".to_string(), |path| path.display().to_string());
    println!("remote.url={}", config.remote.redacted_url());
    println!(
        "sync_rules.include={:?} sync_rules.exclude={:?}",
        config.sync_rules.include_tables, config.sync_rules.exclude_tables
    );
    println!("storage={storage}");
    println!(
        "editor.debounce_ms={} editor.history_limit={}",
        config.editor.debounce.as_millis(),
        config.editor.history_limit
    );
    println!(
        "replication.backoff_base_ms={} replication.backoff_max_ms={} replication.batch_size={}",
        config.replication.backoff_base.as_millis(),
        config.replication.backoff_max.as_millis(),
        config.replication.batch_size
    );
    if config.storage.db_path.is_none() {
        warn!("event=config_check module=cli status=ok storage=memory");
    }
    ExitCode::SUCCESS
}
