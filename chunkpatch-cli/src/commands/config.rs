//! Configuration management CLI commands.
//!
//! Provides `config get`, `config set`, `config list`, and `config path` commands
//! for viewing and modifying configuration settings from the command line.

use std::path::{Path, PathBuf};

use clap::Subcommand;
use chunkpatch::config::{config_file_path, ConfigFile, ConfigKey};

use crate::commands::common::load_config;
use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Get a configuration value
    Get {
        /// Configuration key in format section.key (e.g., download.max_concurrent)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key in format section.key (e.g., download.max_concurrent)
        key: String,

        /// Value to set
        value: String,
    },

    /// List all configuration settings
    List,

    /// Show the configuration file path
    Path,
}

/// Run a config subcommand against `path` or the default file.
pub fn run(command: ConfigCommands, path: Option<&Path>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Get { key } => run_get(&key, path),
        ConfigCommands::Set { key, value } => run_set(&key, &value, path),
        ConfigCommands::List => run_list(path),
        ConfigCommands::Path => run_path(path),
    }
}

fn parse_key(key: &str) -> Result<ConfigKey, CliError> {
    key.parse().map_err(|_| {
        CliError::Config(format!(
            "Unknown configuration key '{}'. Use 'chunkpatch config list' to see available keys.",
            key
        ))
    })
}

fn target_path(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf).unwrap_or_else(config_file_path)
}

/// Load for editing: a file that does not exist yet starts from defaults.
fn load_for_edit(path: Option<&Path>) -> Result<ConfigFile, CliError> {
    if target_path(path).exists() {
        load_config(path)
    } else {
        Ok(ConfigFile::default())
    }
}

/// Get a configuration value.
fn run_get(key: &str, path: Option<&Path>) -> Result<(), CliError> {
    let config_key = parse_key(key)?;
    let config = load_for_edit(path)?;
    let value = config_key.get(&config);

    if value.is_empty() {
        println!("(not set)");
    } else {
        println!("{}", value);
    }

    Ok(())
}

/// Set a configuration value.
fn run_set(key: &str, value: &str, path: Option<&Path>) -> Result<(), CliError> {
    let config_key = parse_key(key)?;

    let mut config = load_for_edit(path)?;
    config_key
        .set(&mut config, value)
        .map_err(|e| CliError::Config(e.to_string()))?;
    config.save_to(&target_path(path))?;

    println!("Set {} = {}", config_key.name(), value);

    Ok(())
}

/// List all configuration settings.
fn run_list(path: Option<&Path>) -> Result<(), CliError> {
    let config = load_for_edit(path)?;

    println!("Configuration Settings");
    println!("======================");
    println!();

    let mut current_section = "";

    for key in ConfigKey::all() {
        let section = key.section();

        if section != current_section {
            if !current_section.is_empty() {
                println!();
            }
            println!("[{}]", section);
            current_section = section;
        }

        let value = key.get(&config);
        let key_name = key.key_name();

        if value.is_empty() {
            println!("  {} = (not set)", key_name);
        } else {
            println!("  {} = {}", key_name, value);
        }
    }

    Ok(())
}

/// Show the configuration file path.
fn run_path(path: Option<&Path>) -> Result<(), CliError> {
    println!("{}", target_path(path).display());
    Ok(())
}
