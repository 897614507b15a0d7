//! Directory-backed chunk store.
//!
//! Chunks live as `chunk_<id>.pak` files in a chunk directory. Downloads
//! stream over HTTP into `chunk_<id>.pak.part` and are renamed into place
//! only after the payload is complete and its checksum (if published)
//! matches, so a listed chunk is always a whole chunk.
//!
//! Mounting symlinks the chunk file into a mount directory the application
//! reads content from.
//!
//! ```text
//! chunk_dir/                     mount_dir/
//!   chunk_1.pak          ◄────────  chunk_1.pak (symlink)
//!   chunk_2.pak
//!   chunk_3.pak.part   (in flight)
//! ```

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::checksum::StreamingChecksum;
use super::{BoxFuture, ChunkStore, ProgressSink};
use crate::chunk::{ChunkEntry, ChunkId};
use crate::error::{PatchError, PatchResult};

/// Default timeout for one chunk download (10 minutes).
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Suffix of in-flight downloads.
const PARTIAL_SUFFIX: &str = "part";

/// Chunk store over a local directory, downloading over HTTP.
#[derive(Debug)]
pub struct DirectoryChunkStore {
    client: Client,
    chunk_dir: PathBuf,
    mount_dir: PathBuf,
    base_url: Option<String>,
    mounted: Mutex<BTreeSet<ChunkId>>,
}

impl DirectoryChunkStore {
    /// Create a store.
    ///
    /// # Arguments
    ///
    /// * `chunk_dir` - Directory holding downloaded chunks
    /// * `mount_dir` - Directory chunks are mounted into
    /// * `base_url` - Download location for chunks without an explicit URL
    pub fn new(
        chunk_dir: impl Into<PathBuf>,
        mount_dir: impl Into<PathBuf>,
        base_url: Option<String>,
    ) -> PatchResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent(concat!("chunkpatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PatchError::transport("http client", e.to_string()))?;

        Ok(Self {
            client,
            chunk_dir: chunk_dir.into(),
            mount_dir: mount_dir.into(),
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
            mounted: Mutex::new(BTreeSet::new()),
        })
    }

    /// Path of a downloaded chunk.
    pub fn chunk_path(&self, id: ChunkId) -> PathBuf {
        self.chunk_dir.join(id.file_name())
    }

    /// Path a chunk is mounted at.
    pub fn mount_path(&self, id: ChunkId) -> PathBuf {
        self.mount_dir.join(id.file_name())
    }

    /// Chunks mounted through this store since it was created.
    pub fn mounted_chunks(&self) -> BTreeSet<ChunkId> {
        self.mounted.lock().clone()
    }

    fn partial_path(&self, id: ChunkId) -> PathBuf {
        self.chunk_dir
            .join(format!("{}.{}", id.file_name(), PARTIAL_SUFFIX))
    }

    fn download_url(&self, chunk: &ChunkEntry) -> PatchResult<String> {
        if let Some(url) = &chunk.url {
            return Ok(url.clone());
        }
        match &self.base_url {
            Some(base) => Ok(format!("{}/{}", base, chunk.id.file_name())),
            None => Err(PatchError::transport(
                format!("chunk {}", chunk.id),
                "no download URL and no base URL configured",
            )),
        }
    }

    async fn fetch_to_partial(
        &self,
        chunk: &ChunkEntry,
        url: &str,
        partial: &Path,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> PatchResult<u64> {
        let transport = |reason: String| PatchError::transport(url, reason);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PatchError::Cancelled),
            response = self.client.get(url).send() => {
                response.map_err(|e| transport(e.to_string()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(transport(format!("HTTP {}", status)));
        }

        let total = response.content_length().or(chunk.size);
        progress.report(0, total);

        let mut file = File::create(partial)
            .await
            .map_err(|e| transport(e.to_string()))?;
        let mut stream = response.bytes_stream();
        let mut checksum = chunk.sha256.as_ref().map(|_| StreamingChecksum::new());
        let mut downloaded = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PatchError::Cancelled),
                next = stream.next() => next,
            };
            let Some(piece) = next else { break };
            let piece = piece.map_err(|e| transport(e.to_string()))?;

            file.write_all(&piece)
                .await
                .map_err(|e| transport(e.to_string()))?;
            if let Some(checksum) = checksum.as_mut() {
                checksum.update(&piece);
            }
            downloaded += piece.len() as u64;
            progress.report(downloaded, total);
        }

        file.flush().await.map_err(|e| transport(e.to_string()))?;
        file.sync_all().await.map_err(|e| transport(e.to_string()))?;
        drop(file);

        if let (Some(expected), Some(checksum)) = (chunk.sha256.as_deref(), checksum) {
            checksum.verify(expected).map_err(|actual| {
                transport(format!(
                    "checksum mismatch: expected {}, got {}",
                    expected, actual
                ))
            })?;
        }

        Ok(downloaded)
    }
}

impl ChunkStore for DirectoryChunkStore {
    fn list_local_chunks(&self) -> BoxFuture<'_, PatchResult<BTreeSet<ChunkId>>> {
        Box::pin(async move {
            let mut present = BTreeSet::new();
            let mut entries = match fs::read_dir(&self.chunk_dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(present),
                Err(e) => {
                    return Err(PatchError::Manifest(format!(
                        "cannot list {}: {}",
                        self.chunk_dir.display(),
                        e
                    )))
                }
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| PatchError::Manifest(e.to_string()))?
            {
                if let Some(id) = entry.file_name().to_str().and_then(ChunkId::from_file_name) {
                    present.insert(id);
                }
            }
            Ok(present)
        })
    }

    fn download_chunk(
        &self,
        chunk: ChunkEntry,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, PatchResult<u64>> {
        Box::pin(async move {
            let url = self.download_url(&chunk)?;
            fs::create_dir_all(&self.chunk_dir)
                .await
                .map_err(|e| PatchError::transport(&url, e.to_string()))?;

            let partial = self.partial_path(chunk.id);
            let result = self
                .fetch_to_partial(&chunk, &url, &partial, &progress, &cancel)
                .await;

            let bytes = match result {
                Ok(bytes) => bytes,
                Err(e) => {
                    if let Err(cleanup) = fs::remove_file(&partial).await {
                        if cleanup.kind() != io::ErrorKind::NotFound {
                            warn!(chunk = %chunk.id, error = %cleanup, "Failed to remove partial download");
                        }
                    }
                    return Err(e);
                }
            };

            fs::rename(&partial, self.chunk_path(chunk.id))
                .await
                .map_err(|e| PatchError::transport(&url, e.to_string()))?;

            debug!(chunk = %chunk.id, bytes, "Chunk stored");
            Ok(bytes)
        })
    }

    fn mount_chunk(&self, chunk: ChunkId) -> BoxFuture<'_, PatchResult<()>> {
        Box::pin(async move {
            let source = self.chunk_path(chunk);
            if !fs::try_exists(&source).await.unwrap_or(false) {
                return Err(PatchError::mount(
                    chunk,
                    format!("{} does not exist", source.display()),
                ));
            }

            fs::create_dir_all(&self.mount_dir)
                .await
                .map_err(|e| PatchError::mount(chunk, e.to_string()))?;

            let target = self.mount_path(chunk);
            if fs::symlink_metadata(&target).await.is_ok() {
                fs::remove_file(&target)
                    .await
                    .map_err(|e| PatchError::mount(chunk, e.to_string()))?;
            }

            link(&source, &target)
                .await
                .map_err(|e| PatchError::mount(chunk, e.to_string()))?;

            self.mounted.lock().insert(chunk);
            debug!(chunk = %chunk, target = %target.display(), "Chunk mounted");
            Ok(())
        })
    }
}

#[cfg(unix)]
async fn link(source: &Path, target: &Path) -> io::Result<()> {
    fs::symlink(source, target).await
}

#[cfg(not(unix))]
async fn link(source: &Path, target: &Path) -> io::Result<()> {
    fs::copy(source, target).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex as SyncMutex;
    use tempfile::TempDir;

    use super::*;
    use crate::backend::checksum::sha256_hex;
    use crate::backend::test_server::{serve, Reply};

    fn store(dir: &TempDir, base_url: Option<String>) -> DirectoryChunkStore {
        DirectoryChunkStore::new(dir.path().join("chunks"), dir.path().join("mount"), base_url)
            .unwrap()
    }

    fn recording_sink() -> (ProgressSink, Arc<SyncMutex<Vec<(u64, Option<u64>)>>>) {
        let reports = Arc::new(SyncMutex::new(Vec::new()));
        let clone = Arc::clone(&reports);
        let sink = ProgressSink::new(move |bytes, total| clone.lock().push((bytes, total)));
        (sink, reports)
    }

    #[tokio::test]
    async fn test_list_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, None);
        assert!(store.list_local_chunks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_ignores_partials_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        let chunks = dir.path().join("chunks");
        std::fs::create_dir_all(&chunks).unwrap();
        std::fs::write(chunks.join("chunk_1.pak"), b"x").unwrap();
        std::fs::write(chunks.join("chunk_2.pak.part"), b"x").unwrap();
        std::fs::write(chunks.join("readme.txt"), b"x").unwrap();

        let listed = store(&dir, None).list_local_chunks().await.unwrap();
        assert_eq!(listed, BTreeSet::from([ChunkId(1)]));
    }

    #[tokio::test]
    async fn test_download_from_base_url() {
        let body = vec![7u8; 4096];
        let server = serve(vec![("/chunk_3.pak", Reply::ok(body.clone()))]).await;
        let dir = TempDir::new().unwrap();
        let store = store(&dir, Some(format!("{}/", server.base_url())));
        let (sink, reports) = recording_sink();

        let entry = ChunkEntry::new(3, "v1").with_sha256(sha256_hex(&body));
        let bytes = store
            .download_chunk(entry, sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bytes, 4096);
        assert_eq!(std::fs::read(store.chunk_path(ChunkId(3))).unwrap(), body);
        assert!(!store.partial_path(ChunkId(3)).exists());

        let reports = reports.lock();
        assert_eq!(reports.first(), Some(&(0, Some(4096))));
        assert_eq!(reports.last(), Some(&(4096, Some(4096))));
    }

    #[tokio::test]
    async fn test_download_unsized_falls_back_to_published_size() {
        let server = serve(vec![("/c", Reply::ok_unsized(vec![1u8; 10]))]).await;
        let dir = TempDir::new().unwrap();
        let store = store(&dir, None);
        let (sink, reports) = recording_sink();

        let entry = ChunkEntry::new(1, "v1")
            .with_url(server.url("/c"))
            .with_size(10);
        store
            .download_chunk(entry, sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reports.lock().first(), Some(&(0, Some(10))));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_nothing_behind() {
        let server = serve(vec![("/chunk_1.pak", Reply::ok(b"payload".to_vec()))]).await;
        let dir = TempDir::new().unwrap();
        let store = store(&dir, Some(server.base_url()));

        let entry = ChunkEntry::new(1, "v1").with_sha256("00ff");
        let err = store
            .download_chunk(entry, ProgressSink::noop(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("checksum mismatch"));
        assert!(!store.chunk_path(ChunkId(1)).exists());
        assert!(!store.partial_path(ChunkId(1)).exists());
    }

    #[tokio::test]
    async fn test_download_http_error() {
        let server = serve(vec![]).await;
        let dir = TempDir::new().unwrap();
        let store = store(&dir, Some(server.base_url()));

        let err = store
            .download_chunk(ChunkEntry::new(9, "v1"), ProgressSink::noop(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PatchError::Transport { .. }));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_download_without_url_fails() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir, None)
            .download_chunk(ChunkEntry::new(1, "v1"), ProgressSink::noop(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no download URL"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, Some("http://127.0.0.1:1".to_string()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store
            .download_chunk(ChunkEntry::new(1, "v1"), ProgressSink::noop(), cancel)
            .await
            .unwrap_err();
        assert_eq!(err, PatchError::Cancelled);
    }

    #[tokio::test]
    async fn test_mount_links_chunk() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, None);
        std::fs::create_dir_all(dir.path().join("chunks")).unwrap();
        std::fs::write(store.chunk_path(ChunkId(5)), b"content").unwrap();

        store.mount_chunk(ChunkId(5)).await.unwrap();
        // Remounting replaces the existing link.
        store.mount_chunk(ChunkId(5)).await.unwrap();

        assert_eq!(std::fs::read(store.mount_path(ChunkId(5))).unwrap(), b"content");
        assert_eq!(store.mounted_chunks(), BTreeSet::from([ChunkId(5)]));
    }

    #[tokio::test]
    async fn test_mount_missing_chunk_fails() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir, None).mount_chunk(ChunkId(2)).await.unwrap_err();
        assert!(matches!(err, PatchError::Mount { chunk: ChunkId(2), .. }));
    }
}
