//! Remote version descriptor.
//!
//! The version payload fetched at the start of every attempt is parsed into a
//! [`VersionDescriptor`]. The default wire schema is JSON:
//!
//! ```json
//! {
//!   "build_id": "2024.06.1-live",
//!   "manifest_url": "https://cdn.example.com/live/manifest",
//!   "chunks": [
//!     { "id": 0, "version": "a1b2", "size": 1048576 },
//!     { "id": 3, "version": "c3d4", "sha256": "..." }
//!   ]
//! }
//! ```
//!
//! Version sources with a different schema override
//! [`VersionSource::parse_descriptor`](crate::backend::VersionSource::parse_descriptor).

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkEntry;
use crate::error::{PatchError, PatchResult};

/// Parsed remote version descriptor.
///
/// Consumed once by the manifest reconciler and not retained afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    /// Content build identifier.
    pub build_id: String,

    /// Location of the full manifest, when the deployment publishes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,

    /// Chunks making up this build, in publication order.
    #[serde(default)]
    pub chunks: Vec<ChunkEntry>,
}

impl VersionDescriptor {
    /// Create a descriptor for a build.
    pub fn new(build_id: impl Into<String>, chunks: Vec<ChunkEntry>) -> Self {
        Self {
            build_id: build_id.into(),
            manifest_url: None,
            chunks,
        }
    }

    /// Parse and validate the default JSON schema.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Parse`] if the payload is not valid JSON for the
    /// schema, the build id is blank, or a chunk has a blank version token.
    pub fn from_json(payload: &[u8]) -> PatchResult<Self> {
        let descriptor: VersionDescriptor =
            serde_json::from_slice(payload).map_err(|e| PatchError::Parse(e.to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Check semantic constraints serde cannot express.
    pub fn validate(&self) -> PatchResult<()> {
        if self.build_id.trim().is_empty() {
            return Err(PatchError::Parse("build_id is empty".to_string()));
        }

        if let Some(chunk) = self.chunks.iter().find(|c| c.version.trim().is_empty()) {
            return Err(PatchError::Parse(format!(
                "chunk {} has an empty version token",
                chunk.id
            )));
        }

        Ok(())
    }

    /// Whether the descriptor lists no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
