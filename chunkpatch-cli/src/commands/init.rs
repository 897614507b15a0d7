//! Init command - create the configuration file.

use std::path::Path;

use chunkpatch::config::{config_file_path, ConfigFile};

use crate::error::CliError;

/// Run the init command.
///
/// An existing file is loaded and rewritten, so new keys appear with their
/// defaults and existing values are kept.
pub fn run(path: Option<&Path>) -> Result<(), CliError> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_file_path);

    let config = if path.exists() {
        ConfigFile::load_from(&path)?
    } else {
        ConfigFile::default()
    };
    config.save_to(&path)?;

    println!("Configuration file: {}", path.display());
    println!();
    println!("  Chunks:   {}", config.chunk_dir().display());
    println!("  Mounts:   {}", config.mount_dir().display());
    println!("  Manifest: {}", config.manifest_path().display());
    println!();
    if config.patch.version_url.is_none() {
        println!("Set the version descriptor URL before patching:");
        println!("  chunkpatch config set patch.version_url https://cdn.example.com/live/version.json");
    } else {
        println!("Run 'chunkpatch patch' to bring content up to date.");
    }
    Ok(())
}
