//! Check command - preview what a patch would download.

use console::style;
use indicatif::HumanBytes;

use chunkpatch::config::ConfigFile;
use chunkpatch::Patcher;

use crate::commands::common::{build_backend, resolve_version_url};
use crate::error::CliError;

/// Run the check command.
pub async fn run(url: Option<String>, config: &ConfigFile) -> Result<(), CliError> {
    let url = resolve_version_url(url, config)?;

    let patcher = Patcher::new(config.to_patcher_config(), build_backend(config)?);
    patcher.init(url.clone()).await?;
    let preview = patcher.preview_patch().await?;

    println!("Version: {}", url);
    println!("Build:   {}", preview.build_id);
    println!();

    if preview.up_to_date {
        println!(
            "{} All {} chunks are up to date.",
            style("✓").green(),
            preview.up_to_date_chunks.len()
        );
        return Ok(());
    }

    let set = &preview.download_set;
    println!(
        "{} chunks to download, {} up to date:",
        set.len(),
        preview.up_to_date_chunks.len()
    );
    for entry in set.entries() {
        let size = entry
            .size
            .map(|s| HumanBytes(s).to_string())
            .unwrap_or_else(|| "size unknown".to_string());
        println!("  {}  {}  ({})", entry.id.file_name(), entry.version, size);
    }

    let known = set.known_bytes();
    if known > 0 {
        println!();
        println!("Known download size: {}", HumanBytes(known));
    }
    Ok(())
}
