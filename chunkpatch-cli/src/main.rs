//! chunkpatch CLI - Command-line interface
//!
//! Runs patch attempts against a configured deployment and manages the
//! configuration file.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;

use chunkpatch::logging::init_logging;

use crate::commands::common::load_config;
use crate::commands::config::ConfigCommands;
use crate::commands::patch::PatchArgs;
use crate::error::CliError;

#[derive(Debug, Parser)]
#[command(name = "chunkpatch", version, about = "Download and mount stale content chunks")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (overrides the config file)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the version descriptor, download stale chunks and mount them
    Patch(PatchArgs),

    /// Show which chunks a patch would download
    Check {
        /// Version descriptor URL (overrides patch.version_url)
        #[arg(long)]
        url: Option<String>,
    },

    /// Show disk space for the chunk directory or a given path
    Disk {
        /// Path to query
        path: Option<PathBuf>,
    },

    /// Create the configuration file with defaults
    Init,

    /// View or change configuration settings
    #[command(subcommand)]
    Config(ConfigCommands),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    // Config commands work on the file itself and need no runtime.
    let command = match cli.command {
        Commands::Init => return commands::init::run(cli.config.as_deref()),
        Commands::Config(command) => return commands::config::run(command, cli.config.as_deref()),
        command => command,
    };

    let config = load_config(cli.config.as_deref())?;
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let _guard = init_logging(level, config.logging.file.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::RuntimeCreation(e.to_string()))?;

    let result = runtime.block_on(async {
        match command {
            Commands::Patch(args) => commands::patch::run(args, &config).await,
            Commands::Check { url } => commands::check::run(url, &config).await,
            Commands::Disk { path } => commands::disk::run(path, &config),
            Commands::Init | Commands::Config(_) => Ok(()),
        }
    });

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}
