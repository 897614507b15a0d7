//! Common helpers shared across CLI commands.

use std::path::Path;
use std::sync::Arc;

use chunkpatch::backend::{DirectoryChunkStore, FileManifestStore, HttpVersionSource, SystemDiskSpace};
use chunkpatch::config::ConfigFile;
use chunkpatch::PatchBackend;

use crate::error::CliError;

/// Load the configuration from `path`, or from the default location.
///
/// A missing default file yields the defaults; a missing explicit file is an
/// error.
pub fn load_config(path: Option<&Path>) -> Result<ConfigFile, CliError> {
    match path {
        Some(path) => Ok(ConfigFile::load_from(path)?),
        None => Ok(ConfigFile::load()?),
    }
}

/// Resolve the version URL: CLI argument first, then config.
pub fn resolve_version_url(cli_url: Option<String>, config: &ConfigFile) -> Result<String, CliError> {
    cli_url
        .or_else(|| config.patch.version_url.clone())
        .ok_or_else(|| {
            CliError::Config(
                "No version URL. Set patch.version_url with 'chunkpatch config set' \
                 or pass --url"
                    .to_string(),
            )
        })
}

/// Build the filesystem and HTTP collaborators described by the config.
pub fn build_backend(config: &ConfigFile) -> Result<PatchBackend, CliError> {
    let version_source = HttpVersionSource::new()?;
    let chunk_store = DirectoryChunkStore::new(
        config.chunk_dir(),
        config.mount_dir(),
        config.storage.base_url.clone(),
    )?;
    let manifest_store = FileManifestStore::new(config.manifest_path());

    Ok(PatchBackend::new(
        Arc::new(version_source),
        Arc::new(chunk_store),
        Arc::new(manifest_store),
    )
    .with_disk_probe(Arc::new(SystemDiskSpace::new())))
}
