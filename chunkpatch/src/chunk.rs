//! Chunk identity types.
//!
//! A chunk is an independently downloadable and mountable unit of content,
//! identified by an integer [`ChunkId`]. The remote version descriptor lists
//! chunks as [`ChunkEntry`] values carrying the version token and optional
//! transfer metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Integer identifier of a content chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub u32);

impl ChunkId {
    /// Create a chunk id.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw integer value.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Canonical on-disk file name for this chunk (`chunk_<id>.pak`).
    pub fn file_name(self) -> String {
        format!("chunk_{}.pak", self.0)
    }

    /// Parse a chunk id back out of a [`file_name`](Self::file_name).
    pub fn from_file_name(name: &str) -> Option<Self> {
        name.strip_prefix("chunk_")
            .and_then(|rest| rest.strip_suffix(".pak"))
            .and_then(|digits| digits.parse::<u32>().ok())
            .map(Self)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ChunkId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// A chunk as listed by the remote version descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// Chunk identifier.
    pub id: ChunkId,

    /// Opaque version token. A local copy is stale when its token differs.
    pub version: String,

    /// Size in bytes, if the descriptor publishes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Expected SHA-256 of the chunk payload (lowercase hex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// Explicit download location. Stores fall back to their own base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ChunkEntry {
    /// Create an entry with only an id and version token.
    pub fn new(id: impl Into<ChunkId>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            size: None,
            sha256: None,
            url: None,
        }
    }

    /// Set the published size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Set the expected SHA-256 checksum.
    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    /// Set the explicit download URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}
