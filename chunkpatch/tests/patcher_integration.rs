//! Integration tests for the patcher.
//!
//! These tests drive complete patch attempts through the in-memory
//! collaborators and check what subscribers, tickets and status snapshots
//! observe:
//! - Stage sequences for success and for each failing stage
//! - Mounting of current chunks, including ones left unmounted earlier
//! - Progress aggregation across concurrent downloads
//! - Stage delivery to subscribers that read late
//! - Failure, retry, disk and mount policies
//! - Shutdown while work is in flight
//!
//! Run with: `cargo test --test patcher_integration`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};

use chunkpatch::backend::{
    FixedDiskSpace, MemoryChunkStore, MemoryManifestStore, MemoryVersionSource, ScriptedChunk,
};
use chunkpatch::{
    AggregateProgress, ChunkEntry, ChunkId, FailurePolicy, MountOrder, PatchBackend, PatchError,
    PatchEvent, PatchEvents, PatchStage, Patcher, PatcherConfig, PatcherError, ProgressUpdate,
    RetryPolicy, VersionDescriptor,
};

// ============================================================================
// Helper Functions
// ============================================================================

const URL: &str = "mem://live/version.json";

struct Harness {
    patcher: Patcher,
    chunks: Arc<MemoryChunkStore>,
    manifests: Arc<MemoryManifestStore>,
    events: PatchEvents,
    progress: broadcast::Receiver<ProgressUpdate>,
}

impl Harness {
    fn new(descriptor: &VersionDescriptor, chunks: MemoryChunkStore) -> Self {
        Self::build(
            MemoryVersionSource::new().with_descriptor(URL, descriptor),
            chunks,
            MemoryManifestStore::new(),
            PatcherConfig::default(),
            None,
        )
    }

    fn build(
        versions: MemoryVersionSource,
        chunks: MemoryChunkStore,
        manifests: MemoryManifestStore,
        config: PatcherConfig,
        disk: Option<FixedDiskSpace>,
    ) -> Self {
        let chunks = Arc::new(chunks);
        let manifests = Arc::new(manifests);
        let mut backend = PatchBackend::new(Arc::new(versions), chunks.clone(), manifests.clone());
        if let Some(disk) = disk {
            backend = backend.with_disk_probe(Arc::new(disk));
        }

        let patcher = Patcher::new(config, backend);
        let events = patcher.subscribe();
        let progress = patcher.subscribe_progress();
        Self {
            patcher,
            chunks,
            manifests,
            events,
            progress,
        }
    }

    /// Init, begin, and collect events up to `Completed`.
    async fn run(&mut self) -> (bool, Vec<PatchEvent>) {
        self.patcher.init(URL).await.unwrap();
        self.run_again().await
    }

    /// Begin without init and collect events up to `Completed`.
    async fn run_again(&mut self) -> (bool, Vec<PatchEvent>) {
        let ticket = self.patcher.begin().await.unwrap();
        let events = collect_until_completed(&mut self.events).await;
        let succeeded = ticket.wait().await.unwrap();

        assert_eq!(
            events.last(),
            Some(&PatchEvent::Completed {
                attempt: events[0].attempt(),
                succeeded
            }),
            "completion event should match the ticket"
        );
        (succeeded, events)
    }
}

/// Drain buffered progress updates, reporting whether any were skipped.
fn drain_progress(rx: &mut broadcast::Receiver<ProgressUpdate>) -> (Vec<AggregateProgress>, bool) {
    let mut updates = Vec::new();
    let mut lagged = false;
    loop {
        match rx.try_recv() {
            Ok(update) => updates.push(update.progress),
            Err(TryRecvError::Lagged(_)) => lagged = true,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return (updates, lagged),
        }
    }
}

async fn collect_until_completed(rx: &mut PatchEvents) -> Vec<PatchEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("attempt should complete")
            .expect("event channel should stay open");
        let done = matches!(event, PatchEvent::Completed { .. });
        events.push(event);
        if done {
            return events;
        }
    }
}

fn stages(events: &[PatchEvent]) -> Vec<PatchStage> {
    events.iter().filter_map(PatchEvent::stage).collect()
}

fn finished_chunks(events: &[PatchEvent]) -> Vec<(ChunkId, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            PatchEvent::ChunkFinished { progress, .. } => Some((progress.chunk_id, progress.success)),
            _ => None,
        })
        .collect()
}

fn assert_canonical(stages: &[PatchStage]) {
    for pair in stages.windows(2) {
        assert!(
            pair[0].ordinal() < pair[1].ordinal(),
            "{} must not follow {}",
            pair[1],
            pair[0]
        );
        assert!(pair[0].transition_to(pair[1]).is_ok());
    }
}

fn descriptor(chunks: &[(u32, &str)]) -> VersionDescriptor {
    VersionDescriptor::new(
        "build-7",
        chunks
            .iter()
            .map(|(id, version)| ChunkEntry::new(*id, *version))
            .collect(),
    )
}

fn ids(raw: &[u32]) -> Vec<ChunkId> {
    raw.iter().copied().map(ChunkId).collect()
}

const SUCCESS_STAGES: [PatchStage; 10] = [
    PatchStage::VersionDownloadStart,
    PatchStage::VersionDownloadSucceed,
    PatchStage::VersionParseSucceed,
    PatchStage::ManifestUpdateStart,
    PatchStage::ManifestUpdateSucceed,
    PatchStage::ChunkDownloadStart,
    PatchStage::ChunkDownloadSucceed,
    PatchStage::MountStart,
    PatchStage::MountSucceed,
    PatchStage::Complete,
];

// ============================================================================
// Reconciliation and the happy path
// ============================================================================

#[tokio::test]
async fn test_downloads_only_stale_chunks() {
    let mut h = Harness::build(
        MemoryVersionSource::new()
            .with_descriptor(URL, &descriptor(&[(1, "v1"), (2, "v1"), (3, "v1")])),
        MemoryChunkStore::new().with_present([1]),
        MemoryManifestStore::new().with_installed(&[(1, "v1")]),
        PatcherConfig::default(),
        None,
    );

    let (succeeded, events) = h.run().await;

    assert!(succeeded);
    assert_eq!(stages(&events), SUCCESS_STAGES);

    let mut started = h.chunks.started_downloads();
    started.sort();
    assert_eq!(started, ids(&[2, 3]));
    assert_eq!(h.chunks.mounted(), ids(&[1, 2, 3]));

    let manifest = h.manifests.manifest();
    assert_eq!(manifest.len(), 3);
    assert_eq!(manifest.build_id.as_deref(), Some("build-7"));
    assert!(manifest.updated_at.is_some());

    let status = h.patcher.status();
    assert_eq!(status.stage, PatchStage::Complete);
    assert_eq!(status.files_downloaded, 2);
    assert_eq!(status.total_files, 2);
}

#[tokio::test]
async fn test_stale_version_and_missing_file_are_downloaded() {
    let mut h = Harness::build(
        MemoryVersionSource::new()
            .with_descriptor(URL, &descriptor(&[(1, "v2"), (2, "v1"), (3, "v1")])),
        // 2 is in the manifest but its file is gone.
        MemoryChunkStore::new().with_present([1, 3]),
        MemoryManifestStore::new().with_installed(&[(1, "v1"), (2, "v1"), (3, "v1")]),
        PatcherConfig::default(),
        None,
    );

    let (succeeded, _) = h.run().await;

    assert!(succeeded);
    let mut started = h.chunks.started_downloads();
    started.sort();
    assert_eq!(started, ids(&[1, 2]));
    assert_eq!(
        h.manifests.manifest().entry(ChunkId(1)).map(|e| e.version.as_str()),
        Some("v2")
    );
}

#[tokio::test]
async fn test_empty_descriptor_completes() {
    let mut h = Harness::new(&descriptor(&[]), MemoryChunkStore::new());

    let (succeeded, events) = h.run().await;

    assert!(succeeded);
    assert_eq!(stages(&events), SUCCESS_STAGES);
    assert!(h.chunks.started_downloads().is_empty());
    assert_eq!(h.manifests.save_count(), 0);
}

#[tokio::test]
async fn test_up_to_date_traverses_download_stages() {
    let mut h = Harness::build(
        MemoryVersionSource::new().with_descriptor(URL, &descriptor(&[(1, "v1"), (2, "v1")])),
        MemoryChunkStore::new().with_present([1, 2]),
        MemoryManifestStore::new().with_installed(&[(1, "v1"), (2, "v1")]),
        PatcherConfig::default(),
        None,
    );

    let (succeeded, events) = h.run().await;

    assert!(succeeded);
    assert_eq!(stages(&events), SUCCESS_STAGES);
    assert!(h.chunks.started_downloads().is_empty());
    assert!(finished_chunks(&events).is_empty());
    // Current content is still made visible.
    assert_eq!(h.chunks.mounted(), ids(&[1, 2]));
    assert_eq!(h.patcher.status().progress.total_chunks_to_mount, 2);
}

#[tokio::test]
async fn test_second_attempt_after_success_is_up_to_date() {
    let mut h = Harness::new(&descriptor(&[(1, "v1"), (2, "v1")]), MemoryChunkStore::new());

    let (first, _) = h.run().await;
    let (second, events) = h.run_again().await;

    assert!(first && second);
    assert_eq!(events[0].attempt(), 2);
    assert_eq!(h.chunks.started_downloads().len(), 2);
}

// ============================================================================
// Failing stages
// ============================================================================

#[tokio::test]
async fn test_version_fetch_failure() {
    let mut h = Harness::build(
        MemoryVersionSource::new().with_error(URL, PatchError::transport(URL, "HTTP 503")),
        MemoryChunkStore::new(),
        MemoryManifestStore::new(),
        PatcherConfig::default(),
        None,
    );

    let (succeeded, events) = h.run().await;

    assert!(!succeeded);
    assert_eq!(
        stages(&events),
        vec![PatchStage::VersionDownloadStart, PatchStage::VersionDownloadFail]
    );
    let status = h.patcher.status();
    assert!(status.last_error.unwrap().contains("HTTP 503"));
}

#[tokio::test]
async fn test_malformed_descriptor_fails_parse() {
    let mut h = Harness::build(
        MemoryVersionSource::new().with_payload(URL, &b"<html>not json</html>"[..]),
        MemoryChunkStore::new(),
        MemoryManifestStore::new(),
        PatcherConfig::default(),
        None,
    );

    let (succeeded, events) = h.run().await;

    assert!(!succeeded);
    assert_eq!(
        stages(&events),
        vec![
            PatchStage::VersionDownloadStart,
            PatchStage::VersionDownloadSucceed,
            PatchStage::VersionParseFail,
        ]
    );
}

#[tokio::test]
async fn test_manifest_load_failure() {
    let mut h = Harness::build(
        MemoryVersionSource::new().with_descriptor(URL, &descriptor(&[(1, "v1")])),
        MemoryChunkStore::new(),
        MemoryManifestStore::new().with_load_error(PatchError::Manifest("corrupt".into())),
        PatcherConfig::default(),
        None,
    );

    let (succeeded, events) = h.run().await;

    assert!(!succeeded);
    assert_eq!(stages(&events).last(), Some(&PatchStage::ManifestUpdateFail));
    assert!(h.chunks.started_downloads().is_empty());
}

#[tokio::test]
async fn test_failed_chunk_fails_download_stage() {
    let mut h = Harness::new(
        &descriptor(&[(1, "v1"), (2, "v1"), (3, "v1")]),
        MemoryChunkStore::new().with_script(
            2,
            ScriptedChunk::new(512).failing(PatchError::transport("chunk_2.pak", "connection reset")),
        ),
    );

    let (succeeded, events) = h.run().await;

    assert!(!succeeded);
    let stages = stages(&events);
    assert_canonical(&stages);
    assert_eq!(stages.last(), Some(&PatchStage::ChunkDownloadFail));
    assert!(!stages.contains(&PatchStage::MountStart));

    let mut finished = finished_chunks(&events);
    finished.sort();
    assert_eq!(
        finished,
        vec![(ChunkId(1), true), (ChunkId(2), false), (ChunkId(3), true)]
    );

    // Successful chunks are still recorded; the build is not stamped.
    let manifest = h.manifests.manifest();
    assert!(manifest.entry(ChunkId(1)).is_some());
    assert!(manifest.entry(ChunkId(2)).is_none());
    assert!(manifest.entry(ChunkId(3)).is_some());
    assert!(manifest.build_id.is_none());
    assert!(h.chunks.mounted().is_empty());

    let status = h.patcher.status();
    assert_eq!(status.stage, PatchStage::ChunkDownloadFail);
    assert!(status.last_error.unwrap().contains("connection reset"));
}

#[tokio::test]
async fn test_manifest_commit_failure_fails_download_stage() {
    let mut h = Harness::build(
        MemoryVersionSource::new().with_descriptor(URL, &descriptor(&[(1, "v1")])),
        MemoryChunkStore::new(),
        MemoryManifestStore::new().with_save_error(PatchError::Manifest("disk full".into())),
        PatcherConfig::default(),
        None,
    );

    let (succeeded, events) = h.run().await;

    assert!(!succeeded);
    assert_eq!(stages(&events).last(), Some(&PatchStage::ChunkDownloadFail));
    assert!(h.patcher.status().last_error.unwrap().contains("disk full"));
    assert!(h.chunks.mounted().is_empty());
}

#[tokio::test]
async fn test_mount_failure_keeps_earlier_mounts() {
    let mut h = Harness::new(
        &descriptor(&[(1, "v1"), (2, "v1"), (3, "v1")]),
        MemoryChunkStore::new().with_mount_failure(2, PatchError::mount(ChunkId(2), "pak rejected")),
    );

    let (succeeded, events) = h.run().await;

    assert!(!succeeded);
    let stages = stages(&events);
    assert_canonical(&stages);
    assert_eq!(stages.last(), Some(&PatchStage::MountFail));
    assert_eq!(h.chunks.mounted(), ids(&[1]));
    assert!(h.patcher.status().last_error.unwrap().contains("pak rejected"));
}

#[tokio::test]
async fn test_next_attempt_mounts_chunk_whose_mount_failed() {
    let mut h = Harness::new(
        &descriptor(&[(1, "v1"), (2, "v1"), (3, "v1")]),
        MemoryChunkStore::new().with_mount_failure(2, PatchError::mount(ChunkId(2), "locked")),
    );

    let (first, _) = h.run().await;
    assert!(!first);
    assert_eq!(h.chunks.mounted(), ids(&[1]));

    h.chunks.clear_mount_failure(ChunkId(2));
    let (second, events) = h.run_again().await;

    assert!(second);
    assert_eq!(stages(&events), SUCCESS_STAGES);
    // Nothing is stale, yet every chunk is mounted.
    assert_eq!(h.chunks.started_downloads().len(), 3);
    assert_eq!(&h.chunks.mounted()[1..], ids(&[1, 2, 3]).as_slice());

    let status = h.patcher.status();
    assert_eq!(status.progress.chunks_mounted, 3);
    assert_eq!(status.progress.total_chunks_to_mount, 3);
}

#[tokio::test]
async fn test_concurrent_mount_drains_after_failure() {
    let mut h = Harness::build(
        MemoryVersionSource::new()
            .with_descriptor(URL, &descriptor(&[(1, "v1"), (2, "v1"), (3, "v1")])),
        MemoryChunkStore::new().with_mount_failure(1, PatchError::mount(ChunkId(1), "busy")),
        MemoryManifestStore::new(),
        PatcherConfig::default().with_mount_order(MountOrder::concurrent(2)),
        None,
    );

    let (succeeded, _) = h.run().await;

    assert!(!succeeded);
    let mut mounted = h.chunks.mounted();
    mounted.sort();
    assert_eq!(mounted, ids(&[2, 3]));
}

// ============================================================================
// Policies
// ============================================================================

#[tokio::test]
async fn test_fail_fast_stops_remaining_downloads() {
    let mut h = Harness::build(
        MemoryVersionSource::new()
            .with_descriptor(URL, &descriptor(&[(1, "v1"), (2, "v1"), (3, "v1"), (4, "v1")])),
        MemoryChunkStore::new()
            .with_script(1, ScriptedChunk::new(100).failing(PatchError::transport("c1", "HTTP 500"))),
        MemoryManifestStore::new(),
        PatcherConfig::default()
            .with_max_concurrent_downloads(1)
            .with_failure_policy(FailurePolicy::FailFast),
        None,
    );

    let (succeeded, events) = h.run().await;

    assert!(!succeeded);
    assert_eq!(h.chunks.started_downloads(), ids(&[1]));
    assert_eq!(finished_chunks(&events), vec![(ChunkId(1), false)]);
    assert!(h.patcher.status().last_error.unwrap().contains("HTTP 500"));
}

#[tokio::test]
async fn test_continue_on_error_attempts_every_chunk() {
    let mut h = Harness::build(
        MemoryVersionSource::new()
            .with_descriptor(URL, &descriptor(&[(1, "v1"), (2, "v1"), (3, "v1")])),
        MemoryChunkStore::new()
            .with_script(1, ScriptedChunk::new(100).failing(PatchError::transport("c1", "HTTP 500"))),
        MemoryManifestStore::new(),
        PatcherConfig::default().with_max_concurrent_downloads(1),
        None,
    );

    let (succeeded, _) = h.run().await;

    assert!(!succeeded);
    assert_eq!(h.chunks.started_downloads(), ids(&[1, 2, 3]));
}

#[tokio::test]
async fn test_retry_recovers_transient_failure() {
    let mut h = Harness::build(
        MemoryVersionSource::new().with_descriptor(URL, &descriptor(&[(1, "v1"), (2, "v1")])),
        MemoryChunkStore::new().with_script(
            2,
            ScriptedChunk::new(256).failing_times(2, PatchError::transport("c2", "timeout")),
        ),
        MemoryManifestStore::new(),
        PatcherConfig::default().with_retry(RetryPolicy::fixed(3, Duration::from_millis(5))),
        None,
    );

    let (succeeded, events) = h.run().await;

    assert!(succeeded);
    let retries = h
        .chunks
        .started_downloads()
        .into_iter()
        .filter(|id| *id == ChunkId(2))
        .count();
    assert_eq!(retries, 3);

    // One final record per chunk, retries included.
    let mut finished = finished_chunks(&events);
    finished.sort();
    assert_eq!(finished, vec![(ChunkId(1), true), (ChunkId(2), true)]);
}

#[tokio::test]
async fn test_insufficient_disk_space_fails_before_downloading() {
    let chunks = vec![
        ChunkEntry::new(1, "v1").with_size(600),
        ChunkEntry::new(2, "v1").with_size(600),
    ];
    let mut h = Harness::build(
        MemoryVersionSource::new().with_descriptor(URL, &VersionDescriptor::new("b", chunks)),
        MemoryChunkStore::new(),
        MemoryManifestStore::new(),
        PatcherConfig::default().with_disk_check("/data/chunks", 100),
        Some(FixedDiskSpace::new(10_000, 1_000)),
    );

    let (succeeded, events) = h.run().await;

    assert!(!succeeded);
    assert_eq!(stages(&events).last(), Some(&PatchStage::ChunkDownloadFail));
    assert!(h.chunks.started_downloads().is_empty());

    let error = h.patcher.status().last_error.unwrap();
    assert_eq!(
        error,
        PatchError::Resource {
            required: 1_300,
            available: 1_000
        }
        .to_string()
    );
}

#[tokio::test]
async fn test_enough_disk_space_proceeds() {
    let chunks = vec![ChunkEntry::new(1, "v1").with_size(600)];
    let mut h = Harness::build(
        MemoryVersionSource::new().with_descriptor(URL, &VersionDescriptor::new("b", chunks)),
        MemoryChunkStore::new(),
        MemoryManifestStore::new(),
        PatcherConfig::default().with_disk_check("/data/chunks", 100),
        Some(FixedDiskSpace::new(10_000, 5_000)),
    );

    let (succeeded, _) = h.run().await;
    assert!(succeeded);
}

// ============================================================================
// Progress
// ============================================================================

#[tokio::test]
async fn test_progress_is_monotonic_and_sums_to_total() {
    let sizes = [(1, 1_000u64), (2, 2_500), (3, 300), (4, 4_096), (5, 10)];
    let mut chunks = MemoryChunkStore::new();
    for (id, size) in sizes {
        let mut script = ScriptedChunk::new(size).with_steps(5);
        if id % 2 == 0 {
            script = script.without_total();
        }
        chunks = chunks.with_script(id, script);
    }

    let mut h = Harness::build(
        MemoryVersionSource::new().with_descriptor(
            URL,
            &descriptor(&[(1, "v"), (2, "v"), (3, "v"), (4, "v"), (5, "v")]),
        ),
        chunks,
        MemoryManifestStore::new(),
        PatcherConfig::default().with_max_concurrent_downloads(3),
        None,
    );

    let (succeeded, _) = h.run().await;
    assert!(succeeded);

    let (progress, lagged) = drain_progress(&mut h.progress);
    assert!(!lagged);
    assert!(!progress.is_empty());
    for pair in progress.windows(2) {
        assert!(pair[1].dominates(&pair[0]), "{:?} regressed to {:?}", pair[0], pair[1]);
        assert!(pair[1].bytes_downloaded <= pair[1].total_bytes_to_download);
    }

    let expected: u64 = sizes.iter().map(|(_, s)| s).sum();
    let last = progress.last().unwrap();
    assert_eq!(last.bytes_downloaded, expected);
    assert_eq!(last.total_bytes_to_download, expected);
    assert_eq!(last.chunks_mounted, 5);
    assert_eq!(last.total_chunks_to_mount, 5);
    assert_eq!(last.download_percent(), 100.0);
    assert_eq!(last.mount_percent(), 100.0);

    let status = h.patcher.status();
    assert_eq!(status.progress, *last);
    assert_eq!(status.files_downloaded, 5);
}

#[tokio::test]
async fn test_late_reader_sees_every_stage_despite_progress_flood() {
    let mut h = Harness::build(
        MemoryVersionSource::new().with_descriptor(URL, &descriptor(&[(1, "v1")])),
        MemoryChunkStore::new().with_script(1, ScriptedChunk::new(8_000).with_steps(2_000)),
        MemoryManifestStore::new(),
        PatcherConfig::default().with_event_capacity(16),
        None,
    );
    h.patcher.init(URL).await.unwrap();

    // Nothing reads events until the attempt is over.
    let ticket = h.patcher.begin().await.unwrap();
    assert!(ticket.wait().await.unwrap());

    let events = collect_until_completed(&mut h.events).await;
    assert_eq!(stages(&events), SUCCESS_STAGES);
    assert_eq!(finished_chunks(&events), vec![(ChunkId(1), true)]);

    // Progress skips ahead but still ends on the final totals.
    let (progress, lagged) = drain_progress(&mut h.progress);
    assert!(lagged);
    let last = progress.last().unwrap();
    assert_eq!(last.bytes_downloaded, 8_000);
    assert_eq!(last.chunks_mounted, 1);
}

#[tokio::test]
async fn test_concurrency_bound_is_respected() {
    let mut chunks = MemoryChunkStore::new();
    for id in 1..=6 {
        chunks = chunks.with_script(
            id,
            ScriptedChunk::new(64).with_step_delay(Duration::from_millis(5)),
        );
    }

    let mut h = Harness::build(
        MemoryVersionSource::new().with_descriptor(
            URL,
            &descriptor(&[(1, "v"), (2, "v"), (3, "v"), (4, "v"), (5, "v"), (6, "v")]),
        ),
        chunks,
        MemoryManifestStore::new(),
        PatcherConfig::default().with_max_concurrent_downloads(2),
        None,
    );

    let (succeeded, _) = h.run().await;

    assert!(succeeded);
    assert!(h.chunks.peak_concurrency() <= 2);
    assert!(h.chunks.peak_concurrency() >= 1);
    assert_eq!(h.chunks.started_downloads().len(), 6);
}

#[tokio::test]
async fn test_status_is_idempotent() {
    let mut h = Harness::new(&descriptor(&[(1, "v1")]), MemoryChunkStore::new());
    let (succeeded, _) = h.run().await;
    assert!(succeeded);

    let first = h.patcher.status();
    let second = h.patcher.status();
    assert_eq!(first, second);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_begin_while_in_flight_is_rejected() {
    let mut h = Harness::new(
        &descriptor(&[(1, "v1")]),
        MemoryChunkStore::new()
            .with_script(1, ScriptedChunk::new(64).with_step_delay(Duration::from_millis(20))),
    );
    h.patcher.init(URL).await.unwrap();

    let ticket = h.patcher.begin().await.unwrap();
    let err = h.patcher.begin().await.unwrap_err();
    assert!(matches!(err, PatcherError::AttemptInProgress { .. }));

    assert!(ticket.wait().await.unwrap());
    let events = collect_until_completed(&mut h.events).await;
    assert!(events.iter().all(|e| e.attempt() == 1));
}

#[tokio::test]
async fn test_shutdown_mid_download_discards_late_events() {
    let mut h = Harness::new(
        &descriptor(&[(1, "v1")]),
        MemoryChunkStore::new().with_script(
            1,
            ScriptedChunk::new(64)
                .with_step_delay(Duration::from_millis(40))
                .ignoring_cancel(),
        ),
    );
    h.patcher.init(URL).await.unwrap();
    let ticket = h.patcher.begin().await.unwrap();

    // Wait until the download is running.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        if event.stage() == Some(PatchStage::ChunkDownloadStart) {
            break;
        }
    }

    h.patcher.shutdown().await.unwrap();
    assert_eq!(ticket.wait().await, Err(PatcherError::Cancelled));

    // Everything emitted before shutdown is already buffered.
    while let Some(event) = h.events.try_recv() {
        assert!(
            !matches!(event, PatchEvent::Completed { .. }),
            "cancelled attempt must not complete"
        );
    }

    // The backend ignores cancellation and finishes anyway.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(h.events.try_recv().is_none());
    let status = h.patcher.status();
    assert_eq!(status.stage, PatchStage::Idle);
    assert!(status.last_error.is_none());
    assert_eq!(h.manifests.save_count(), 0);
}

#[tokio::test]
async fn test_shutdown_then_reinit_runs_fresh_attempt() {
    let mut h = Harness::new(
        &descriptor(&[(1, "v1")]),
        MemoryChunkStore::new()
            .with_script(1, ScriptedChunk::new(64).with_step_delay(Duration::from_millis(20))),
    );
    h.patcher.init(URL).await.unwrap();
    let _cancelled = h.patcher.begin().await.unwrap();
    h.patcher.shutdown().await.unwrap();

    // Drop whatever the cancelled attempt emitted.
    while h.events.try_recv().is_some() {}

    let (succeeded, events) = h.run().await;

    assert!(succeeded);
    assert_eq!(events[0].attempt(), 2);
    assert_eq!(stages(&events), SUCCESS_STAGES);
}
