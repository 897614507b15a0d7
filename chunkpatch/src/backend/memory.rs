//! In-memory collaborators.
//!
//! Used by tests and demos to drive the patcher without a network or disk.
//! Chunk downloads are scripted with [`ScriptedChunk`]: payload size, number
//! of progress reports, per-report delay and failures.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{BoxFuture, ChunkStore, ManifestStore, ProgressSink, VersionSource};
use crate::chunk::{ChunkEntry, ChunkId};
use crate::descriptor::VersionDescriptor;
use crate::error::{PatchError, PatchResult};
use crate::manifest::LocalManifest;

/// Default payload size of an unscripted chunk.
const DEFAULT_CHUNK_SIZE: u64 = 1024;

/// Serves version payloads from a map keyed by URL.
#[derive(Debug, Default)]
pub struct MemoryVersionSource {
    payloads: Mutex<HashMap<String, PatchResult<Vec<u8>>>>,
    delay: Mutex<Duration>,
    fetches: AtomicUsize,
}

impl MemoryVersionSource {
    /// Create an empty source. Every URL answers with a transport error.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `descriptor` as JSON at `url`.
    pub fn with_descriptor(self, url: &str, descriptor: &VersionDescriptor) -> Self {
        self.set_descriptor(url, descriptor);
        self
    }

    /// Serve raw bytes at `url`.
    pub fn with_payload(self, url: &str, payload: impl Into<Vec<u8>>) -> Self {
        self.payloads
            .lock()
            .insert(url.to_string(), Ok(payload.into()));
        self
    }

    /// Fail fetches of `url`.
    pub fn with_error(self, url: &str, error: PatchError) -> Self {
        self.payloads.lock().insert(url.to_string(), Err(error));
        self
    }

    /// Delay every fetch.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    /// Replace the descriptor served at `url`.
    pub fn set_descriptor(&self, url: &str, descriptor: &VersionDescriptor) {
        let payload = serde_json::to_vec(descriptor).map_err(|e| PatchError::Parse(e.to_string()));
        self.payloads.lock().insert(url.to_string(), payload);
    }

    /// Number of fetches so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl VersionSource for MemoryVersionSource {
    fn fetch_version(&self, url: &str) -> BoxFuture<'_, PatchResult<Vec<u8>>> {
        let url = url.to_string();
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.payloads
                .lock()
                .get(&url)
                .cloned()
                .unwrap_or_else(|| Err(PatchError::transport(&url, "HTTP 404")))
        })
    }
}

/// Scripted behaviour of one chunk download.
#[derive(Debug, Clone)]
pub struct ScriptedChunk {
    size: u64,
    steps: u32,
    step_delay: Duration,
    report_total: bool,
    failures: u32,
    error: Option<PatchError>,
    ignore_cancel: bool,
}

impl ScriptedChunk {
    /// A chunk of `size` bytes delivered in four reports.
    pub fn new(size: u64) -> Self {
        Self {
            size,
            steps: 4,
            step_delay: Duration::ZERO,
            report_total: true,
            failures: 0,
            error: None,
            ignore_cancel: false,
        }
    }

    /// Number of progress reports (at least 1).
    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps.max(1);
        self
    }

    /// Delay before each progress report.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Do not report a total until the download finishes.
    pub fn without_total(mut self) -> Self {
        self.report_total = false;
        self
    }

    /// Fail every attempt with `error` after the first progress report.
    pub fn failing(mut self, error: PatchError) -> Self {
        self.failures = u32::MAX;
        self.error = Some(error);
        self
    }

    /// Fail the first `times` attempts, then succeed.
    pub fn failing_times(mut self, times: u32, error: PatchError) -> Self {
        self.failures = times;
        self.error = Some(error);
        self
    }

    /// Keep going after cancellation, as a misbehaving backend would.
    pub fn ignoring_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }
}

/// Chunk store holding chunk ids in memory.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    present: Mutex<BTreeSet<ChunkId>>,
    scripts: Mutex<HashMap<ChunkId, ScriptedChunk>>,
    attempts: Mutex<HashMap<ChunkId, u32>>,
    started: Mutex<Vec<ChunkId>>,
    mount_failures: Mutex<HashMap<ChunkId, PatchError>>,
    mounted: Mutex<Vec<ChunkId>>,
    list_error: Mutex<Option<PatchError>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryChunkStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark chunks as already present.
    pub fn with_present(self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.present.lock().extend(ids.into_iter().map(ChunkId));
        self
    }

    /// Script the download of a chunk.
    pub fn with_script(self, id: u32, script: ScriptedChunk) -> Self {
        self.scripts.lock().insert(ChunkId(id), script);
        self
    }

    /// Fail mounting a chunk.
    pub fn with_mount_failure(self, id: u32, error: PatchError) -> Self {
        self.mount_failures.lock().insert(ChunkId(id), error);
        self
    }

    /// Let a chunk that was set up to fail mounting mount again.
    pub fn clear_mount_failure(&self, id: ChunkId) {
        self.mount_failures.lock().remove(&id);
    }

    /// Fail listing local chunks.
    pub fn with_list_error(self, error: PatchError) -> Self {
        *self.list_error.lock() = Some(error);
        self
    }

    /// Remove a chunk, as if its file had been deleted.
    pub fn evict(&self, id: ChunkId) {
        self.present.lock().remove(&id);
    }

    /// Chunks currently present.
    pub fn present(&self) -> BTreeSet<ChunkId> {
        self.present.lock().clone()
    }

    /// Chunks whose download was started, in start order. Retries repeat.
    pub fn started_downloads(&self) -> Vec<ChunkId> {
        self.started.lock().clone()
    }

    /// Chunks mounted, in mount order.
    pub fn mounted(&self) -> Vec<ChunkId> {
        self.mounted.lock().clone()
    }

    /// Highest number of simultaneous downloads seen.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn script(&self, id: ChunkId) -> ScriptedChunk {
        self.scripts
            .lock()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| ScriptedChunk::new(DEFAULT_CHUNK_SIZE))
    }

    async fn run_script(
        &self,
        script: &ScriptedChunk,
        attempt: u32,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> PatchResult<u64> {
        let total = script.report_total.then_some(script.size);
        progress.report(0, total);

        for step in 1..=script.steps {
            if !script.step_delay.is_zero() {
                if script.ignore_cancel {
                    tokio::time::sleep(script.step_delay).await;
                } else {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(PatchError::Cancelled),
                        _ = tokio::time::sleep(script.step_delay) => {}
                    }
                }
            } else if cancel.is_cancelled() && !script.ignore_cancel {
                return Err(PatchError::Cancelled);
            }

            if attempt <= script.failures {
                if let Some(error) = &script.error {
                    return Err(error.clone());
                }
            }

            let bytes = script.size * u64::from(step) / u64::from(script.steps);
            progress.report(bytes, total);
            tokio::task::yield_now().await;
        }

        Ok(script.size)
    }
}

impl ChunkStore for MemoryChunkStore {
    fn list_local_chunks(&self) -> BoxFuture<'_, PatchResult<BTreeSet<ChunkId>>> {
        Box::pin(async move {
            if let Some(error) = self.list_error.lock().clone() {
                return Err(error);
            }
            Ok(self.present.lock().clone())
        })
    }

    fn download_chunk(
        &self,
        chunk: ChunkEntry,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, PatchResult<u64>> {
        Box::pin(async move {
            let script = self.script(chunk.id);
            let attempt = {
                let mut attempts = self.attempts.lock();
                let count = attempts.entry(chunk.id).or_insert(0);
                *count += 1;
                *count
            };
            self.started.lock().push(chunk.id);

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            let result = self
                .run_script(&script, attempt, &progress, &cancel)
                .await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if result.is_ok() {
                self.present.lock().insert(chunk.id);
            }
            result
        })
    }

    fn mount_chunk(&self, chunk: ChunkId) -> BoxFuture<'_, PatchResult<()>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            if let Some(error) = self.mount_failures.lock().get(&chunk).cloned() {
                return Err(error);
            }
            if !self.present.lock().contains(&chunk) {
                return Err(PatchError::mount(chunk, "chunk is not present"));
            }
            self.mounted.lock().push(chunk);
            Ok(())
        })
    }
}

/// Manifest held in memory.
#[derive(Debug, Default)]
pub struct MemoryManifestStore {
    manifest: Mutex<LocalManifest>,
    saves: AtomicUsize,
    save_error: Mutex<Option<PatchError>>,
    load_error: Mutex<Option<PatchError>>,
}

impl MemoryManifestStore {
    /// Create a store with an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing manifest.
    pub fn with_manifest(self, manifest: LocalManifest) -> Self {
        *self.manifest.lock() = manifest;
        self
    }

    /// Record `(id, version)` pairs as installed.
    pub fn with_installed(self, installed: &[(u32, &str)]) -> Self {
        {
            let mut manifest = self.manifest.lock();
            for (id, version) in installed {
                manifest.record_download(&ChunkEntry::new(*id, *version), 0);
            }
        }
        self
    }

    /// Fail every save.
    pub fn with_save_error(self, error: PatchError) -> Self {
        *self.save_error.lock() = Some(error);
        self
    }

    /// Fail every load.
    pub fn with_load_error(self, error: PatchError) -> Self {
        *self.load_error.lock() = Some(error);
        self
    }

    /// Current manifest.
    pub fn manifest(&self) -> LocalManifest {
        self.manifest.lock().clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl ManifestStore for MemoryManifestStore {
    fn load(&self) -> BoxFuture<'_, PatchResult<LocalManifest>> {
        Box::pin(async move {
            if let Some(error) = self.load_error.lock().clone() {
                return Err(error);
            }
            Ok(self.manifest.lock().clone())
        })
    }

    fn save(&self, manifest: LocalManifest) -> BoxFuture<'_, PatchResult<()>> {
        Box::pin(async move {
            if let Some(error) = self.save_error.lock().clone() {
                return Err(error);
            }
            *self.manifest.lock() = manifest;
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
