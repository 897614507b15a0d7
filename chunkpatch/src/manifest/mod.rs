//! Local manifest and reconciliation.
//!
//! The [`LocalManifest`] records which chunks were installed by previous
//! successful downloads and at which version token. Reconciling it against a
//! freshly fetched [`VersionDescriptor`](crate::VersionDescriptor) yields the
//! minimal [`ChunkDownloadSet`] for the next attempt.
//!
//! The manifest is only updated with chunks whose download succeeded, and is
//! persisted through a [`ManifestStore`](crate::backend::ManifestStore) that
//! writes atomically.

mod reconcile;

pub use reconcile::{ChunkDownloadSet, ManifestReconciler, Reconciliation};

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkEntry, ChunkId};

/// One installed chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Chunk identifier.
    pub id: ChunkId,
    /// Version token the chunk was downloaded at.
    pub version: String,
    /// Installed size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Record of locally installed chunks.
///
/// Entries are kept sorted by chunk id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalManifest {
    /// Build the manifest was last committed for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,

    /// When the manifest was last committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    chunks: Vec<ManifestEntry>,
}

impl LocalManifest {
    /// Create an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the entry for a chunk.
    pub fn entry(&self, id: ChunkId) -> Option<&ManifestEntry> {
        self.chunks
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|idx| &self.chunks[idx])
    }

    /// Insert or replace the entry for a chunk.
    pub fn record(&mut self, entry: ManifestEntry) {
        match self.chunks.binary_search_by_key(&entry.id, |e| e.id) {
            Ok(idx) => self.chunks[idx] = entry,
            Err(idx) => self.chunks.insert(idx, entry),
        }
    }

    /// Record a chunk from the descriptor that finished downloading.
    pub fn record_download(&mut self, chunk: &ChunkEntry, bytes: u64) {
        self.record(ManifestEntry {
            id: chunk.id,
            version: chunk.version.clone(),
            size: chunk.size.or(Some(bytes)),
        });
    }

    /// Remove a chunk's entry, returning it.
    pub fn remove(&mut self, id: ChunkId) -> Option<ManifestEntry> {
        self.chunks
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|idx| self.chunks.remove(idx))
    }

    /// All entries, sorted by chunk id.
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.chunks
    }

    /// Number of recorded chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Stamp the manifest before it is committed.
    pub fn stamp(&mut self, build_id: &str) {
        self.build_id = Some(build_id.to_string());
        self.updated_at = Some(Utc::now());
    }
}

/// Local state the reconciler compares against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalState {
    /// Persisted manifest.
    pub manifest: LocalManifest,
    /// Chunk ids the storage backend actually has on hand.
    pub present: BTreeSet<ChunkId>,
}

impl LocalState {
    /// Combine a manifest with the store's chunk listing.
    pub fn new(manifest: LocalManifest, present: BTreeSet<ChunkId>) -> Self {
        Self { manifest, present }
    }

    /// Version token of a chunk that is both recorded and present.
    pub fn installed_version(&self, id: ChunkId) -> Option<&str> {
        if !self.present.contains(&id) {
            return None;
        }
        self.manifest.entry(id).map(|e| e.version.as_str())
    }
}
