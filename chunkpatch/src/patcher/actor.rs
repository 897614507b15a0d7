//! The coordinating task behind a [`Patcher`](super::Patcher).
//!
//! The actor is the single writer of the session, the progress aggregator and
//! the coordinators. It reacts to two inputs:
//!
//! ```text
//!   Patcher handle ── Command ──►┌───────────┐── PatchEvent ──► subscribers
//!                                │           │── Progress ────► progress channel
//!                                │   Actor   │── PatchStats ──► status watch
//!   stage tasks ── StageEvent ──►└─────┬─────┘── bool ────────► PatchTicket
//!        ▲                             │
//!        └──────── tokio::spawn ───────┘
//! ```
//!
//! Collaborator calls never run on the actor itself. Every stage task reports
//! back with the attempt id it was spawned for; reports for any other attempt
//! are dropped, which is how shutdown discards late completions.

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{PatchBackend, ProgressSink};
use crate::chunk::{ChunkEntry, ChunkId};
use crate::config::PatcherConfig;
use crate::coordinator::{download_with_retry, DownloadCoordinator, DownloadOutcome, MountCoordinator};
use crate::descriptor::VersionDescriptor;
use crate::error::{PatchError, PatchResult, PatcherError, PatcherResult};
use crate::events::{EventHub, PatchEvent, ProgressUpdate, StageEvent, StageEventKind};
use crate::manifest::{LocalManifest, LocalState, ManifestReconciler, Reconciliation};
use crate::progress::{PatchStats, ProgressAggregator};
use crate::session::PatchSession;
use crate::state::PatchStage;

// =============================================================================
// Commands
// =============================================================================

/// Requests from the handle.
#[derive(Debug)]
pub(super) enum Command {
    Init {
        url: String,
        reply: oneshot::Sender<PatcherResult<()>>,
    },
    Begin {
        reply: oneshot::Sender<PatcherResult<(u64, oneshot::Receiver<bool>)>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    VersionUrl {
        reply: oneshot::Sender<Option<String>>,
    },
}

/// Whether an attempt keeps running after handling an event.
enum Flow {
    Continue,
    Finished,
}

// =============================================================================
// Attempt
// =============================================================================

/// Everything scoped to one running attempt.
struct Attempt {
    id: u64,
    /// Cancels every task of the attempt.
    cancel: CancellationToken,
    /// Child of `cancel`; fired on its own by the fail-fast policy.
    download_cancel: CancellationToken,
    completion: Option<oneshot::Sender<bool>>,
    descriptor: Option<VersionDescriptor>,
    /// Reconciled targets; the download set itself moves into `downloads`.
    reconciliation: Option<Reconciliation>,
    manifest: LocalManifest,
    downloads: Option<DownloadCoordinator>,
    download_outcome: Option<DownloadOutcome>,
    mounts: Option<MountCoordinator>,
}

impl Attempt {
    fn new(id: u64, completion: oneshot::Sender<bool>) -> Self {
        let cancel = CancellationToken::new();
        let download_cancel = cancel.child_token();
        Self {
            id,
            cancel,
            download_cancel,
            completion: Some(completion),
            descriptor: None,
            reconciliation: None,
            manifest: LocalManifest::new(),
            downloads: None,
            download_outcome: None,
            mounts: None,
        }
    }
}

// =============================================================================
// Actor
// =============================================================================

pub(super) struct Actor {
    config: PatcherConfig,
    backend: PatchBackend,
    session: PatchSession,
    version_url: Option<String>,
    aggregator: ProgressAggregator,
    next_attempt: u64,
    current: Option<Attempt>,
    events: EventHub,
    progress: broadcast::Sender<ProgressUpdate>,
    status: watch::Sender<PatchStats>,
    stage_tx: mpsc::UnboundedSender<StageEvent>,
}

impl Actor {
    pub(super) fn new(
        config: PatcherConfig,
        backend: PatchBackend,
        events: EventHub,
        progress: broadcast::Sender<ProgressUpdate>,
        status: watch::Sender<PatchStats>,
        stage_tx: mpsc::UnboundedSender<StageEvent>,
    ) -> Self {
        let session = PatchSession::new(&config.deployment_name, &config.platform_name);
        Self {
            config,
            backend,
            session,
            version_url: None,
            aggregator: ProgressAggregator::new(),
            next_attempt: 1,
            current: None,
            events,
            progress,
            status,
            stage_tx,
        }
    }

    /// Run until every handle is dropped.
    pub(super) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut stage_rx: mpsc::UnboundedReceiver<StageEvent>,
    ) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },

                Some(event) = stage_rx.recv() => self.on_stage_event(event),
            }
        }

        if let Some(attempt) = self.current.take() {
            attempt.cancel.cancel();
        }
        debug!("Patcher task stopped");
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Init { url, reply } => {
                let _ = reply.send(self.init(url));
            }
            Command::Begin { reply } => {
                let _ = reply.send(self.begin());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
            Command::VersionUrl { reply } => {
                let _ = reply.send(self.version_url.clone());
            }
        }
    }

    fn init(&mut self, url: String) -> PatcherResult<()> {
        if let Some(existing) = &self.version_url {
            warn!(
                existing = %existing,
                rejected = %url,
                "Patching system already initialized; keeping the first URL"
            );
            return Err(PatcherError::AlreadyInitialized {
                url: existing.clone(),
            });
        }

        info!(url = %url, "Patching system initialized");
        self.session = PatchSession::new(&self.config.deployment_name, &self.config.platform_name);
        self.version_url = Some(url);
        self.publish_status();
        Ok(())
    }

    fn begin(&mut self) -> PatcherResult<(u64, oneshot::Receiver<bool>)> {
        let Some(url) = self.version_url.clone() else {
            warn!("Patch requested before initialization");
            return Err(PatcherError::NotInitialized);
        };

        if self.current.is_some() || self.session.is_in_flight() {
            let stage = self.session.stage();
            warn!(stage = %stage, "Patch requested while an attempt is in progress");
            return Err(PatcherError::AttemptInProgress { stage });
        }

        let id = self.next_attempt;
        let stage = self
            .session
            .restart(id)
            .map_err(|e| PatcherError::AttemptInProgress { stage: e.from })?;
        self.next_attempt += 1;
        self.aggregator = ProgressAggregator::new();

        let (completion_tx, completion_rx) = oneshot::channel();
        let attempt = Attempt::new(id, completion_tx);

        info!(attempt = id, url = %url, "Beginning patch");
        self.announce(id, stage);
        self.spawn_version_fetch(&attempt, url);
        self.current = Some(attempt);

        Ok((id, completion_rx))
    }

    fn shutdown(&mut self) {
        if let Some(attempt) = self.current.take() {
            info!(attempt = attempt.id, stage = %self.session.stage(), "Cancelling patch attempt");
            attempt.cancel.cancel();
        }

        self.session.reset();
        self.version_url = None;
        self.aggregator = ProgressAggregator::new();
        self.publish_status();
        info!("Patching system shut down");
    }

    // -------------------------------------------------------------------------
    // Stage events
    // -------------------------------------------------------------------------

    fn on_stage_event(&mut self, event: StageEvent) {
        let Some(mut attempt) = self.current.take() else {
            debug!(attempt = event.attempt, "Dropping event for finished attempt");
            return;
        };

        if attempt.id != event.attempt {
            debug!(
                attempt = event.attempt,
                current = attempt.id,
                "Dropping event for stale attempt"
            );
            self.current = Some(attempt);
            return;
        }

        let flow = match event.kind {
            StageEventKind::VersionFetched(result) => self.on_version_fetched(&mut attempt, result),
            StageEventKind::LocalStateLoaded(result) => self.on_local_state(&mut attempt, result),
            StageEventKind::DownloadProgress {
                chunk,
                bytes,
                total,
            } => self.on_download_progress(&mut attempt, chunk, bytes, total),
            StageEventKind::DownloadFinished { chunk, result } => {
                self.on_download_finished(&mut attempt, chunk, result)
            }
            StageEventKind::ManifestCommitted(result) => {
                self.on_manifest_committed(&mut attempt, result)
            }
            StageEventKind::MountFinished { chunk, result } => {
                self.on_mount_finished(&mut attempt, chunk, result)
            }
        };

        if let Flow::Continue = flow {
            self.current = Some(attempt);
        }
    }

    fn on_version_fetched(&mut self, attempt: &mut Attempt, result: PatchResult<Vec<u8>>) -> Flow {
        let payload = match result {
            Ok(payload) => payload,
            Err(e) => return self.fail(attempt, PatchStage::VersionDownloadFail, e),
        };

        debug!(attempt = attempt.id, bytes = payload.len(), "Version descriptor fetched");
        self.enter(attempt, PatchStage::VersionDownloadSucceed);

        let descriptor = match self.backend.version_source.parse_descriptor(&payload) {
            Ok(descriptor) => descriptor,
            Err(e) => return self.fail(attempt, PatchStage::VersionParseFail, e),
        };

        info!(
            attempt = attempt.id,
            build_id = %descriptor.build_id,
            chunks = descriptor.chunks.len(),
            "Version descriptor parsed"
        );
        self.session.set_build_id(&descriptor.build_id);
        attempt.descriptor = Some(descriptor);
        self.enter(attempt, PatchStage::VersionParseSucceed);

        self.enter(attempt, PatchStage::ManifestUpdateStart);
        self.spawn_local_state_load(attempt);
        Flow::Continue
    }

    fn on_local_state(&mut self, attempt: &mut Attempt, result: PatchResult<LocalState>) -> Flow {
        let local = match result {
            Ok(local) => local,
            Err(e) => return self.fail(attempt, PatchStage::ManifestUpdateFail, e),
        };

        let Some(descriptor) = attempt.descriptor.take() else {
            error!(attempt = attempt.id, "Local state loaded without a descriptor");
            return self.fail(
                attempt,
                PatchStage::ManifestUpdateFail,
                PatchError::Manifest("no version descriptor for this attempt".to_string()),
            );
        };

        let mut reconciliation = ManifestReconciler::new().reconcile(&descriptor, &local);
        if reconciliation.up_to_date {
            info!(attempt = attempt.id, build_id = %reconciliation.build_id, "Content is up to date");
        } else {
            info!(
                attempt = attempt.id,
                stale = reconciliation.download_set.len(),
                current = reconciliation.up_to_date_chunks.len(),
                "Chunks to download"
            );
        }

        attempt.manifest = local.manifest;
        let set = std::mem::take(&mut reconciliation.download_set);
        attempt.reconciliation = Some(reconciliation);
        self.session.set_pending(set.ids());
        self.enter(attempt, PatchStage::ManifestUpdateSucceed);

        self.enter(attempt, PatchStage::ChunkDownloadStart);
        self.aggregator.begin_download(set.len(), set.known_bytes());
        self.publish_progress(attempt.id);

        if let Err(e) = self.check_disk_space(set.known_bytes()) {
            return self.fail(attempt, PatchStage::ChunkDownloadFail, e);
        }

        attempt.downloads = Some(DownloadCoordinator::new(
            set,
            self.config.download_concurrency(),
            self.config.failure_policy,
        ));
        self.pump_downloads(attempt)
    }

    fn on_download_progress(
        &mut self,
        attempt: &mut Attempt,
        chunk: ChunkId,
        bytes: u64,
        total: Option<u64>,
    ) -> Flow {
        if let Some(downloads) = attempt.downloads.as_mut() {
            let delta = downloads.on_progress(chunk, bytes, total);
            if self.aggregator.apply(delta) {
                self.publish_progress(attempt.id);
            }
        }
        Flow::Continue
    }

    fn on_download_finished(
        &mut self,
        attempt: &mut Attempt,
        chunk: ChunkId,
        result: PatchResult<u64>,
    ) -> Flow {
        let Some(downloads) = attempt.downloads.as_mut() else {
            return Flow::Continue;
        };
        let Some(finished) = downloads.on_finished(chunk, result) else {
            return Flow::Continue;
        };

        if finished.abort {
            warn!(attempt = attempt.id, chunk = %chunk, "Cancelling remaining downloads");
            attempt.download_cancel.cancel();
        }

        if finished.record.success {
            self.aggregator.record_file_downloaded();
            self.session.mark_downloaded(chunk);
        }
        self.aggregator.apply(finished.delta);
        self.publish_progress(attempt.id);
        self.emit(PatchEvent::ChunkFinished {
            attempt: attempt.id,
            progress: finished.record,
        });

        self.pump_downloads(attempt)
    }

    fn on_manifest_committed(&mut self, attempt: &mut Attempt, result: PatchResult<()>) -> Flow {
        if let Err(e) = result {
            return self.fail(attempt, PatchStage::ChunkDownloadFail, e);
        }
        debug!(attempt = attempt.id, "Manifest committed");
        self.resolve_downloads(attempt)
    }

    fn on_mount_finished(
        &mut self,
        attempt: &mut Attempt,
        chunk: ChunkId,
        result: PatchResult<()>,
    ) -> Flow {
        let Some(mounts) = attempt.mounts.as_mut() else {
            return Flow::Continue;
        };

        let mounted = result.is_ok();
        if !mounts.on_finished(chunk, result) {
            return Flow::Continue;
        }
        if mounted {
            self.aggregator.record_mount();
            self.publish_progress(attempt.id);
        }

        self.pump_mounts(attempt)
    }

    // -------------------------------------------------------------------------
    // Download stage
    // -------------------------------------------------------------------------

    fn check_disk_space(&self, download_bytes: u64) -> PatchResult<()> {
        let (Some(path), Some(probe)) = (&self.config.disk_check_path, &self.backend.disk_probe)
        else {
            return Ok(());
        };

        let required = download_bytes.saturating_add(self.config.min_free_space);
        match probe.disk_space(path) {
            Ok(space) if space.free < required => {
                warn!(
                    path = %path.display(),
                    required,
                    available = space.free,
                    "Not enough disk space for download"
                );
                Err(PatchError::Resource {
                    required,
                    available: space.free,
                })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Disk space check failed; continuing");
                Ok(())
            }
        }
    }

    /// Start whatever downloads the coordinator allows and finish the pass
    /// once every chunk has an outcome.
    fn pump_downloads(&mut self, attempt: &mut Attempt) -> Flow {
        let Some(downloads) = attempt.downloads.as_mut() else {
            return Flow::Continue;
        };

        while let Some(entry) = downloads.next_dispatch() {
            self.spawn_download(attempt.id, &attempt.download_cancel, entry);
        }

        if !downloads.is_finished() {
            return Flow::Continue;
        }

        let outcome = match attempt.downloads.take() {
            Some(downloads) => downloads.into_outcome(),
            None => return Flow::Continue,
        };

        if outcome.succeeded.is_empty() {
            attempt.download_outcome = Some(outcome);
            return self.resolve_downloads(attempt);
        }

        let mut manifest = attempt.manifest.clone();
        for (entry, bytes) in &outcome.succeeded {
            manifest.record_download(entry, *bytes);
        }
        if outcome.is_success() {
            if let Some(build_id) = self.session.build_id() {
                manifest.stamp(build_id);
            }
        }

        attempt.download_outcome = Some(outcome);
        self.spawn_manifest_commit(attempt, manifest);
        Flow::Continue
    }

    fn resolve_downloads(&mut self, attempt: &mut Attempt) -> Flow {
        let outcome = attempt.download_outcome.take().unwrap_or_default();

        if !outcome.is_success() {
            let error = outcome.stage_error().unwrap_or(PatchError::Cancelled);
            info!(
                attempt = attempt.id,
                succeeded = outcome.succeeded.len(),
                failed = outcome.failed.len(),
                skipped = outcome.skipped.len(),
                "Download pass failed"
            );
            return self.fail(attempt, PatchStage::ChunkDownloadFail, error);
        }

        self.enter(attempt, PatchStage::ChunkDownloadSucceed);

        let downloaded: Vec<ChunkId> = outcome.succeeded.iter().map(|(e, _)| e.id).collect();
        let chunks = match &attempt.reconciliation {
            Some(reconciliation) => reconciliation.mount_set(&downloaded),
            None => downloaded,
        };
        debug!(attempt = attempt.id, chunks = chunks.len(), "Chunks to mount");

        self.enter(attempt, PatchStage::MountStart);
        self.aggregator.begin_mount(chunks.len());
        self.publish_progress(attempt.id);

        attempt.mounts = Some(MountCoordinator::new(chunks, self.config.mount_order));
        self.pump_mounts(attempt)
    }

    // -------------------------------------------------------------------------
    // Mount stage
    // -------------------------------------------------------------------------

    fn pump_mounts(&mut self, attempt: &mut Attempt) -> Flow {
        let Some(mounts) = attempt.mounts.as_mut() else {
            return Flow::Continue;
        };

        while let Some(chunk) = mounts.next_dispatch() {
            self.spawn_mount(attempt.id, &attempt.cancel, chunk);
        }

        if !mounts.is_finished() {
            return Flow::Continue;
        }

        let outcome = match attempt.mounts.take() {
            Some(mounts) => mounts.into_outcome(),
            None => return Flow::Continue,
        };

        if !outcome.is_success() {
            let error = outcome.first_error().unwrap_or(PatchError::Cancelled);
            return self.fail(attempt, PatchStage::MountFail, error);
        }

        info!(attempt = attempt.id, mounted = outcome.mounted.len(), "Mount pass finished");
        self.enter(attempt, PatchStage::MountSucceed);
        self.enter(attempt, PatchStage::Complete);
        self.finish(attempt, true)
    }

    // -------------------------------------------------------------------------
    // Stage tasks
    // -------------------------------------------------------------------------

    fn spawn_version_fetch(&self, attempt: &Attempt, url: String) {
        let source = self.backend.version_source.clone();
        let cancel = attempt.cancel.clone();
        let tx = self.stage_tx.clone();
        let id = attempt.id;

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PatchError::Cancelled),
                result = source.fetch_version(&url) => result,
            };
            let _ = tx.send(StageEvent::new(id, StageEventKind::VersionFetched(result)));
        });
    }

    fn spawn_local_state_load(&self, attempt: &Attempt) {
        let manifests = self.backend.manifest_store.clone();
        let chunks = self.backend.chunk_store.clone();
        let cancel = attempt.cancel.clone();
        let tx = self.stage_tx.clone();
        let id = attempt.id;

        tokio::spawn(async move {
            let load = async {
                let manifest = manifests.load().await?;
                let present = chunks.list_local_chunks().await?;
                Ok::<_, PatchError>(LocalState::new(manifest, present))
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PatchError::Cancelled),
                result = load => result,
            };
            let _ = tx.send(StageEvent::new(id, StageEventKind::LocalStateLoaded(result)));
        });
    }

    fn spawn_download(&self, id: u64, cancel: &CancellationToken, entry: ChunkEntry) {
        let chunk = entry.id;
        let progress_tx = self.stage_tx.clone();
        let sink = ProgressSink::new(move |bytes, total| {
            let _ = progress_tx.send(StageEvent::new(
                id,
                StageEventKind::DownloadProgress {
                    chunk,
                    bytes,
                    total,
                },
            ));
        });

        let store = self.backend.chunk_store.clone();
        let cancel = cancel.clone();
        let retry = self.config.retry.clone();
        let tx = self.stage_tx.clone();

        debug!(attempt = id, chunk = %chunk, "Starting chunk download");
        tokio::spawn(async move {
            let result = download_with_retry(store, entry, sink, cancel, retry).await;
            let _ = tx.send(StageEvent::new(
                id,
                StageEventKind::DownloadFinished { chunk, result },
            ));
        });
    }

    fn spawn_manifest_commit(&self, attempt: &Attempt, manifest: LocalManifest) {
        let store = self.backend.manifest_store.clone();
        let tx = self.stage_tx.clone();
        let id = attempt.id;

        // Runs to completion after shutdown; the result is then stale.
        tokio::spawn(async move {
            let result = store.save(manifest).await;
            let _ = tx.send(StageEvent::new(id, StageEventKind::ManifestCommitted(result)));
        });
    }

    fn spawn_mount(&self, id: u64, cancel: &CancellationToken, chunk: ChunkId) {
        let store = self.backend.chunk_store.clone();
        let cancel = cancel.clone();
        let tx = self.stage_tx.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PatchError::Cancelled),
                result = store.mount_chunk(chunk) => result,
            };
            let _ = tx.send(StageEvent::new(id, StageEventKind::MountFinished { chunk, result }));
        });
    }

    // -------------------------------------------------------------------------
    // Transitions and outputs
    // -------------------------------------------------------------------------

    /// Move the session to `stage` and announce it.
    fn enter(&mut self, attempt: &Attempt, stage: PatchStage) {
        match self.session.transition(stage) {
            Ok(stage) => self.announce(attempt.id, stage),
            Err(e) => error!(attempt = attempt.id, error = %e, "Rejected stage transition"),
        }
    }

    /// Move the session to a `*Fail` stage and complete the attempt.
    fn fail(&mut self, attempt: &mut Attempt, stage: PatchStage, error: PatchError) -> Flow {
        match self.session.fail(stage, &error) {
            Ok(stage) => {
                warn!(attempt = attempt.id, stage = %stage, error = %error, "Patch stage failed");
                self.announce(attempt.id, stage);
            }
            Err(e) => error!(attempt = attempt.id, error = %e, "Rejected stage transition"),
        }
        self.finish(attempt, false)
    }

    fn finish(&mut self, attempt: &mut Attempt, succeeded: bool) -> Flow {
        info!(attempt = attempt.id, succeeded, "Patch attempt finished");
        self.emit(PatchEvent::Completed {
            attempt: attempt.id,
            succeeded,
        });
        if let Some(completion) = attempt.completion.take() {
            let _ = completion.send(succeeded);
        }
        self.publish_status();
        Flow::Finished
    }

    fn announce(&self, attempt: u64, stage: PatchStage) {
        info!(attempt, stage = %stage, "Patch stage");
        self.emit(PatchEvent::StageChanged { attempt, stage });
        self.publish_status();
    }

    fn publish_progress(&self, attempt: u64) {
        // No receivers is not an error.
        let _ = self.progress.send(ProgressUpdate {
            attempt,
            progress: self.aggregator.snapshot(),
        });
        self.publish_status();
    }

    fn emit(&self, event: PatchEvent) {
        self.events.publish(&event);
    }

    fn publish_status(&self) {
        let stats = PatchStats::project(
            self.session.stage(),
            self.session.build_id().map(str::to_string),
            &self.aggregator,
            self.session.error().map(str::to_string),
        );
        self.status.send_replace(stats);
    }
}

/// Fetch, parse and reconcile without touching any patcher state.
pub(super) async fn preview(backend: &PatchBackend, url: &str) -> PatchResult<Reconciliation> {
    let payload = backend.version_source.fetch_version(url).await?;
    let descriptor = backend.version_source.parse_descriptor(&payload)?;
    let manifest = backend.manifest_store.load().await?;
    let present = backend.chunk_store.list_local_chunks().await?;
    let local = LocalState::new(manifest, present);
    Ok(ManifestReconciler::new().reconcile(&descriptor, &local))
}
