//! Progress tracking for patch attempts.
//!
//! Per-chunk [`ChunkProgress`] records live in the download coordinator. Each
//! time a record moves forward the coordinator hands the difference to the
//! [`ProgressAggregator`] as a [`ProgressDelta`]. Deltas are never negative,
//! so the aggregated numbers only ever grow within an attempt.
//!
//! # Growing totals
//!
//! A chunk's size is often unknown until its HTTP response headers arrive.
//! The aggregate total starts as the sum of the sizes already known and is
//! raised as more sizes resolve. Percentages computed from it are a rough
//! indicator: early in a pass the download percentage can overshoot what the
//! final ratio will be, and it can pause while the denominator catches up.

use crate::chunk::ChunkId;
use crate::state::PatchStage;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Download progress of one chunk in the current pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Chunk identifier.
    pub chunk_id: ChunkId,
    /// Bytes received so far (never decreases).
    pub bytes_downloaded: u64,
    /// Total bytes, once known.
    pub bytes_total: Option<u64>,
    /// Whether the chunk has reached a final outcome.
    pub done: bool,
    /// Whether that outcome was success.
    pub success: bool,
}

impl ChunkProgress {
    /// Fresh record, optionally seeded with the published size.
    pub fn new(chunk_id: ChunkId, bytes_total: Option<u64>) -> Self {
        Self {
            chunk_id,
            bytes_downloaded: 0,
            bytes_total,
            done: false,
            success: false,
        }
    }

    /// Apply a byte report and return how much the record moved.
    ///
    /// Reports that go backwards (for example after a retry restarts the
    /// transfer) are absorbed: the record keeps its high-water mark.
    pub fn observe(&mut self, bytes: u64, total: Option<u64>) -> ProgressDelta {
        let mut delta = ProgressDelta::default();

        if bytes > self.bytes_downloaded {
            delta.bytes = bytes - self.bytes_downloaded;
            self.bytes_downloaded = bytes;
        }

        let known = self.bytes_total.unwrap_or(0);
        let reported = total.unwrap_or(0).max(self.bytes_downloaded);
        if reported > known {
            delta.total = reported - known;
            self.bytes_total = Some(reported);
        }

        delta
    }

    /// Mark the chunk finished. On success the record is settled at its
    /// final byte count so downloaded equals total.
    pub fn finish(&mut self, success: bool, final_bytes: u64) -> ProgressDelta {
        let mut delta = ProgressDelta::default();
        if success {
            let target = final_bytes.max(self.bytes_total.unwrap_or(0));
            delta = self.observe(target, Some(target));
        }
        self.done = true;
        self.success = success;
        delta
    }
}

/// Growth of the aggregate byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressDelta {
    /// Newly downloaded bytes.
    pub bytes: u64,
    /// Newly discovered total bytes.
    pub total: u64,
}

impl ProgressDelta {
    /// Whether the delta changes nothing.
    pub fn is_zero(&self) -> bool {
        self.bytes == 0 && self.total == 0
    }
}

/// Aggregated progress of one attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateProgress {
    pub bytes_downloaded: u64,
    pub total_bytes_to_download: u64,
    pub chunks_mounted: usize,
    pub total_chunks_to_mount: usize,
}

impl AggregateProgress {
    /// Download completion in percent (0-100). Rough while totals resolve.
    pub fn download_percent(&self) -> f32 {
        if self.total_bytes_to_download == 0 {
            return 0.0;
        }
        let ratio = self.bytes_downloaded as f64 / self.total_bytes_to_download as f64;
        (ratio.min(1.0) * 100.0) as f32
    }

    /// Mount completion in percent (0-100).
    pub fn mount_percent(&self) -> f32 {
        if self.total_chunks_to_mount == 0 {
            return 0.0;
        }
        let ratio = self.chunks_mounted as f64 / self.total_chunks_to_mount as f64;
        (ratio.min(1.0) * 100.0) as f32
    }

    /// Whether every field is `>=` the matching field of `earlier`.
    pub fn dominates(&self, earlier: &AggregateProgress) -> bool {
        self.bytes_downloaded >= earlier.bytes_downloaded
            && self.total_bytes_to_download >= earlier.total_bytes_to_download
            && self.chunks_mounted >= earlier.chunks_mounted
            && self.total_chunks_to_mount >= earlier.total_chunks_to_mount
    }
}

/// Running sums over an attempt's downloads and mounts.
#[derive(Debug, Clone, Default)]
pub struct ProgressAggregator {
    current: AggregateProgress,
    files_downloaded: usize,
    total_files: usize,
}

impl ProgressAggregator {
    /// Create an aggregator with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a download pass of `chunk_count` chunks with `known_bytes` of
    /// published size.
    pub fn begin_download(&mut self, chunk_count: usize, known_bytes: u64) {
        self.total_files = self.total_files.max(chunk_count);
        self.current.total_bytes_to_download =
            self.current.total_bytes_to_download.max(known_bytes);
    }

    /// Fold in a per-chunk delta. Returns whether the aggregate changed.
    pub fn apply(&mut self, delta: ProgressDelta) -> bool {
        if delta.is_zero() {
            return false;
        }
        self.current.bytes_downloaded += delta.bytes;
        self.current.total_bytes_to_download += delta.total;
        if self.current.bytes_downloaded > self.current.total_bytes_to_download {
            self.current.total_bytes_to_download = self.current.bytes_downloaded;
        }
        true
    }

    /// Count a chunk whose download succeeded.
    pub fn record_file_downloaded(&mut self) {
        self.files_downloaded += 1;
    }

    /// Start a mount pass over `chunk_count` chunks.
    pub fn begin_mount(&mut self, chunk_count: usize) {
        self.current.total_chunks_to_mount = self.current.total_chunks_to_mount.max(chunk_count);
    }

    /// Count a successfully mounted chunk.
    pub fn record_mount(&mut self) {
        self.current.chunks_mounted += 1;
        if self.current.chunks_mounted > self.current.total_chunks_to_mount {
            self.current.total_chunks_to_mount = self.current.chunks_mounted;
        }
    }

    /// Current aggregate.
    pub fn snapshot(&self) -> AggregateProgress {
        self.current
    }

    /// Chunks downloaded successfully so far.
    pub fn files_downloaded(&self) -> usize {
        self.files_downloaded
    }

    /// Chunks in the download set.
    pub fn total_files(&self) -> usize {
        self.total_files
    }
}

/// User-facing summary of the patcher, for polling UIs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchStats {
    /// Current stage.
    pub stage: PatchStage,
    /// Build id of the current or last attempt.
    pub build_id: Option<String>,
    /// Chunks downloaded successfully.
    pub files_downloaded: usize,
    /// Chunks in the download set.
    pub total_files: usize,
    /// Download completion in percent (rough, see module docs).
    pub download_percent: f32,
    /// Whole megabytes downloaded.
    pub mb_downloaded: u64,
    /// Whole megabytes to download.
    pub mb_total: u64,
    /// Error text of the last failed stage, kept until the next attempt.
    pub last_error: Option<String>,
    /// Raw aggregate the figures above are derived from.
    pub progress: AggregateProgress,
}

impl PatchStats {
    /// Project the aggregator and session state into a snapshot.
    pub fn project(
        stage: PatchStage,
        build_id: Option<String>,
        aggregator: &ProgressAggregator,
        last_error: Option<String>,
    ) -> Self {
        let progress = aggregator.snapshot();
        Self {
            stage,
            build_id,
            files_downloaded: aggregator.files_downloaded(),
            total_files: aggregator.total_files(),
            download_percent: progress.download_percent(),
            mb_downloaded: progress.bytes_downloaded / BYTES_PER_MB,
            mb_total: progress.total_bytes_to_download / BYTES_PER_MB,
            last_error,
            progress,
        }
    }
}
