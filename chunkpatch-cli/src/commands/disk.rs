//! Disk command - report capacity of the chunk filesystem.

use std::path::PathBuf;

use chunkpatch::backend::SystemDiskSpace;
use chunkpatch::config::ConfigFile;
use chunkpatch::DiskSpaceProbe;
use indicatif::HumanBytes;

use crate::error::CliError;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Run the disk command.
pub fn run(path: Option<PathBuf>, config: &ConfigFile) -> Result<(), CliError> {
    let path = path.unwrap_or_else(|| config.chunk_dir());
    let space = SystemDiskSpace::new().disk_space(&path)?;
    let reserve = config.disk.min_free_mb * BYTES_PER_MB;

    println!("Path:     {}", path.display());
    println!("Total:    {}", HumanBytes(space.total));
    println!("Free:     {}", HumanBytes(space.free));
    println!("Reserved: {}", HumanBytes(reserve));
    println!(
        "Usable:   {}",
        HumanBytes(space.free.saturating_sub(reserve))
    );
    Ok(())
}
