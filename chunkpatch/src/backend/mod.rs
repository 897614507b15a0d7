//! Collaborator interfaces and their implementations.
//!
//! The patcher core never talks to the network or the filesystem directly.
//! Everything outside the state machine goes through four traits:
//!
//! | Trait | Responsibility | Implementations |
//! |-------|----------------|-----------------|
//! | [`VersionSource`] | Fetch and parse the version descriptor | [`HttpVersionSource`], [`MemoryVersionSource`] |
//! | [`ChunkStore`] | List, download and mount chunks | [`DirectoryChunkStore`], [`MemoryChunkStore`] |
//! | [`ManifestStore`] | Persist the local manifest atomically | [`FileManifestStore`], [`MemoryManifestStore`] |
//! | [`DiskSpaceProbe`] | Report free disk space | [`SystemDiskSpace`], [`FixedDiskSpace`] |
//!
//! # Dyn Compatibility
//!
//! Async methods return [`BoxFuture`] so collaborators can be held as
//! `Arc<dyn Trait>` and swapped for in-memory versions in tests.

mod checksum;
mod directory;
mod disk;
mod http;
mod manifest_file;
mod memory;

#[cfg(test)]
pub(crate) mod test_server;

pub use checksum::{sha256_hex, StreamingChecksum};
pub use directory::DirectoryChunkStore;
pub use disk::{FixedDiskSpace, SystemDiskSpace};
pub use http::HttpVersionSource;
pub use manifest_file::FileManifestStore;
pub use memory::{MemoryChunkStore, MemoryManifestStore, MemoryVersionSource, ScriptedChunk};

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::chunk::{ChunkEntry, ChunkId};
use crate::descriptor::VersionDescriptor;
use crate::error::PatchResult;
use crate::manifest::LocalManifest;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Fetches the remote version descriptor.
pub trait VersionSource: Send + Sync {
    /// Fetch the raw descriptor payload.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Transport`](crate::PatchError::Transport) when the
    /// payload cannot be retrieved.
    fn fetch_version(&self, url: &str) -> BoxFuture<'_, PatchResult<Vec<u8>>>;

    /// Parse a fetched payload.
    ///
    /// The default implementation reads the JSON schema described in
    /// [`descriptor`](crate::descriptor). Sources with their own schema
    /// override this.
    fn parse_descriptor(&self, payload: &[u8]) -> PatchResult<VersionDescriptor> {
        VersionDescriptor::from_json(payload)
    }
}

/// Stores, downloads and mounts chunks.
pub trait ChunkStore: Send + Sync {
    /// Chunk ids the store currently has on hand.
    fn list_local_chunks(&self) -> BoxFuture<'_, PatchResult<BTreeSet<ChunkId>>>;

    /// Download one chunk.
    ///
    /// Byte progress is reported through `progress` as it arrives. The
    /// download stops with [`PatchError::Cancelled`](crate::PatchError::Cancelled)
    /// once `cancel` fires. On success returns the final byte count.
    fn download_chunk(
        &self,
        chunk: ChunkEntry,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, PatchResult<u64>>;

    /// Make a downloaded chunk visible to the application.
    fn mount_chunk(&self, chunk: ChunkId) -> BoxFuture<'_, PatchResult<()>>;
}

/// Persists the local manifest.
pub trait ManifestStore: Send + Sync {
    /// Load the manifest. A store with nothing saved returns an empty one.
    fn load(&self) -> BoxFuture<'_, PatchResult<LocalManifest>>;

    /// Replace the saved manifest.
    ///
    /// Implementations must be atomic: after a crash either the old or the new
    /// manifest is readable, never a mix.
    fn save(&self, manifest: LocalManifest) -> BoxFuture<'_, PatchResult<()>>;
}

/// Capacity of the filesystem holding a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    /// Total bytes.
    pub total: u64,
    /// Bytes available to unprivileged writers.
    pub free: u64,
}

/// Reports disk capacity.
pub trait DiskSpaceProbe: Send + Sync {
    /// Capacity of the filesystem holding `path`.
    fn disk_space(&self, path: &Path) -> PatchResult<DiskSpace>;
}

/// Callback receiving `(bytes_downloaded, bytes_total)` for one chunk.
///
/// Reports are cumulative for the chunk. Cloning shares the callback.
#[derive(Clone)]
pub struct ProgressSink {
    callback: Arc<dyn Fn(u64, Option<u64>) + Send + Sync>,
}

impl ProgressSink {
    /// Wrap a callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// A sink that discards reports.
    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    /// Report cumulative progress.
    pub fn report(&self, bytes_downloaded: u64, bytes_total: Option<u64>) {
        (self.callback)(bytes_downloaded, bytes_total);
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSink").finish_non_exhaustive()
    }
}

/// The set of collaborators a [`Patcher`](crate::Patcher) works with.
#[derive(Clone)]
pub struct PatchBackend {
    pub version_source: Arc<dyn VersionSource>,
    pub chunk_store: Arc<dyn ChunkStore>,
    pub manifest_store: Arc<dyn ManifestStore>,
    /// Probe used by the disk check. `None` skips it.
    pub disk_probe: Option<Arc<dyn DiskSpaceProbe>>,
}

impl PatchBackend {
    /// Bundle the required collaborators.
    pub fn new(
        version_source: Arc<dyn VersionSource>,
        chunk_store: Arc<dyn ChunkStore>,
        manifest_store: Arc<dyn ManifestStore>,
    ) -> Self {
        Self {
            version_source,
            chunk_store,
            manifest_store,
            disk_probe: None,
        }
    }

    /// Attach a disk space probe.
    pub fn with_disk_probe(mut self, probe: Arc<dyn DiskSpaceProbe>) -> Self {
        self.disk_probe = Some(probe);
        self
    }
}

impl fmt::Debug for PatchBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchBackend")
            .field("disk_probe", &self.disk_probe.is_some())
            .finish_non_exhaustive()
    }
}
