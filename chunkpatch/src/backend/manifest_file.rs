//! JSON manifest file with atomic replacement.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{BoxFuture, ManifestStore};
use crate::error::{PatchError, PatchResult};
use crate::manifest::LocalManifest;

/// Stores the manifest as pretty-printed JSON.
///
/// Saves write a sibling temporary file, sync it, and rename it over the
/// manifest.
#[derive(Debug, Clone)]
pub struct FileManifestStore {
    path: PathBuf,
}

impl FileManifestStore {
    /// Create a store for a manifest path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Manifest path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "manifest.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn write_atomic(&self, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let temp = self.temp_path();
        let mut file = fs::File::create(&temp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp, &self.path).await
    }
}

impl ManifestStore for FileManifestStore {
    fn load(&self) -> BoxFuture<'_, PatchResult<LocalManifest>> {
        Box::pin(async move {
            let bytes = match fs::read(&self.path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %self.path.display(), "No manifest yet");
                    return Ok(LocalManifest::new());
                }
                Err(e) => {
                    return Err(PatchError::Manifest(format!(
                        "cannot read {}: {}",
                        self.path.display(),
                        e
                    )))
                }
            };

            serde_json::from_slice(&bytes).map_err(|e| {
                PatchError::Manifest(format!("corrupt manifest {}: {}", self.path.display(), e))
            })
        })
    }

    fn save(&self, manifest: LocalManifest) -> BoxFuture<'_, PatchResult<()>> {
        Box::pin(async move {
            let bytes = serde_json::to_vec_pretty(&manifest)
                .map_err(|e| PatchError::Manifest(e.to_string()))?;

            if let Err(e) = self.write_atomic(&bytes).await {
                let _ = fs::remove_file(self.temp_path()).await;
                return Err(PatchError::Manifest(format!(
                    "cannot write {}: {}",
                    self.path.display(),
                    e
                )));
            }

            debug!(path = %self.path.display(), chunks = manifest.len(), "Manifest saved");
            Ok(())
        })
    }
}
