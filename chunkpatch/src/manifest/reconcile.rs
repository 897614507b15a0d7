//! Manifest reconciliation.
//!
//! Compares the remote descriptor against local state and produces the
//! minimal, ordered set of chunks to download.

use std::collections::HashSet;

use tracing::debug;

use super::LocalState;
use crate::chunk::{ChunkEntry, ChunkId};
use crate::descriptor::VersionDescriptor;

/// Ordered, duplicate-free set of chunks to download for one attempt.
///
/// Order is the order in which the descriptor lists the chunks. Once built
/// the set is read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkDownloadSet {
    chunks: Vec<ChunkEntry>,
}

impl ChunkDownloadSet {
    /// Build a set from entries, keeping the first occurrence of each id.
    pub fn from_entries(entries: impl IntoIterator<Item = ChunkEntry>) -> Self {
        let mut seen = HashSet::new();
        let chunks = entries
            .into_iter()
            .filter(|entry| seen.insert(entry.id))
            .collect();
        Self { chunks }
    }

    /// Chunk ids in download order.
    pub fn ids(&self) -> Vec<ChunkId> {
        self.chunks.iter().map(|c| c.id).collect()
    }

    /// Entries in download order.
    pub fn entries(&self) -> &[ChunkEntry] {
        &self.chunks
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether there is nothing to download.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Sum of the sizes the descriptor publishes. Chunks without a size
    /// contribute nothing.
    pub fn known_bytes(&self) -> u64 {
        self.chunks.iter().filter_map(|c| c.size).sum()
    }

    /// Entry for a chunk id.
    pub fn get(&self, id: ChunkId) -> Option<&ChunkEntry> {
        self.chunks.iter().find(|c| c.id == id)
    }
}

/// Outcome of reconciling a descriptor with local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Build the descriptor describes.
    pub build_id: String,
    /// Chunks to download, in descriptor order.
    pub download_set: ChunkDownloadSet,
    /// Chunks that are already present at the right version.
    pub up_to_date_chunks: Vec<ChunkId>,
    /// Every distinct chunk the descriptor lists, in descriptor order.
    pub target_chunks: Vec<ChunkId>,
    /// True when nothing needs downloading.
    pub up_to_date: bool,
}

impl Reconciliation {
    /// Chunks to mount after a download pass: every target chunk that was
    /// already current or is in `downloaded`, in descriptor order.
    ///
    /// Mounting covers current chunks too, so a chunk whose mount failed in
    /// an earlier attempt is mounted again even though it needs no download.
    pub fn mount_set(&self, downloaded: &[ChunkId]) -> Vec<ChunkId> {
        let ready: HashSet<ChunkId> = self
            .up_to_date_chunks
            .iter()
            .chain(downloaded)
            .copied()
            .collect();
        self.target_chunks
            .iter()
            .copied()
            .filter(|id| ready.contains(id))
            .collect()
    }
}

/// Computes download sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestReconciler;

impl ManifestReconciler {
    /// Create a reconciler.
    pub fn new() -> Self {
        Self
    }

    /// Reconcile a descriptor against local state.
    ///
    /// A chunk is downloaded when the store does not have it, the manifest
    /// has no record of it, or the recorded version token differs from the
    /// descriptor's. Duplicate descriptor entries are collapsed to their
    /// first occurrence.
    pub fn reconcile(&self, descriptor: &VersionDescriptor, local: &LocalState) -> Reconciliation {
        let mut seen = HashSet::new();
        let mut stale = Vec::new();
        let mut current = Vec::new();
        let mut targets = Vec::new();

        for chunk in &descriptor.chunks {
            if !seen.insert(chunk.id) {
                debug!(chunk = %chunk.id, "Ignoring duplicate descriptor entry");
                continue;
            }
            targets.push(chunk.id);

            match local.installed_version(chunk.id) {
                Some(version) if version == chunk.version => current.push(chunk.id),
                _ => stale.push(chunk.clone()),
            }
        }

        let download_set = ChunkDownloadSet::from_entries(stale);
        let up_to_date = download_set.is_empty();

        debug!(
            build_id = %descriptor.build_id,
            stale = download_set.len(),
            current = current.len(),
            "Reconciled manifest"
        );

        Reconciliation {
            build_id: descriptor.build_id.clone(),
            download_set,
            up_to_date_chunks: current,
            target_chunks: targets,
            up_to_date,
        }
    }
}
