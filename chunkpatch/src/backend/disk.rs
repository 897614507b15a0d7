//! Disk space probes.

use std::path::{Path, PathBuf};

use super::{DiskSpace, DiskSpaceProbe};
use crate::error::{PatchError, PatchResult};

/// Queries the operating system with `statvfs`.
///
/// Paths that do not exist yet are resolved to their nearest existing
/// ancestor, so the chunk directory can be checked before it is created.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDiskSpace;

impl SystemDiskSpace {
    /// Create a probe.
    pub fn new() -> Self {
        Self
    }
}

impl DiskSpaceProbe for SystemDiskSpace {
    fn disk_space(&self, path: &Path) -> PatchResult<DiskSpace> {
        let existing = nearest_existing(path).ok_or_else(|| {
            PatchError::transport(path.display().to_string(), "no existing ancestor")
        })?;
        statvfs(&existing)
    }
}

fn nearest_existing(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    absolute.ancestors().find(|p| p.exists()).map(Path::to_path_buf)
}

#[cfg(unix)]
fn statvfs(path: &Path) -> PatchResult<DiskSpace> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        PatchError::transport(path.display().to_string(), "path contains a NUL byte")
    })?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(PatchError::transport(path.display().to_string(), err.to_string()));
    }

    let block = stat.f_frsize as u64;
    Ok(DiskSpace {
        total: (stat.f_blocks as u64).saturating_mul(block),
        free: (stat.f_bavail as u64).saturating_mul(block),
    })
}

#[cfg(not(unix))]
fn statvfs(path: &Path) -> PatchResult<DiskSpace> {
    Err(PatchError::transport(
        path.display().to_string(),
        "disk space query is not supported on this platform",
    ))
}

/// Probe that reports fixed numbers.
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskSpace {
    space: DiskSpace,
}

impl FixedDiskSpace {
    /// Report `free` of `total` bytes for every path.
    pub fn new(total: u64, free: u64) -> Self {
        Self {
            space: DiskSpace { total, free },
        }
    }
}

impl DiskSpaceProbe for FixedDiskSpace {
    fn disk_space(&self, _path: &Path) -> PatchResult<DiskSpace> {
        Ok(self.space)
    }
}
