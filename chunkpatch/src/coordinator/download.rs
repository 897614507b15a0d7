//! Download coordinator.
//!
//! Bookkeeping for one download pass. The coordinator never performs I/O
//! itself: the patcher asks it which chunks to start, spawns the transfers,
//! and feeds progress reports and outcomes back in. Each report updates the
//! chunk's [`ChunkProgress`] and yields the [`ProgressDelta`] the aggregator
//! should absorb.
//!
//! ```text
//!   pending ──next_dispatch()──► in flight ──on_finished()──► succeeded
//!      │                            │                          failed
//!      └────── FailFast abort ──────┴────────────────────────► skipped
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{ChunkStore, ProgressSink};
use crate::chunk::{ChunkEntry, ChunkId};
use crate::error::{PatchError, PatchResult};
use crate::manifest::ChunkDownloadSet;
use crate::policy::{FailurePolicy, RetryPolicy};
use crate::progress::{ChunkProgress, ProgressDelta};

/// Final record of a chunk handed back by [`DownloadCoordinator::on_finished`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FinishedChunk {
    pub record: ChunkProgress,
    pub delta: ProgressDelta,
    pub error: Option<PatchError>,
    /// The failure policy asks for in-flight downloads to be cancelled.
    pub abort: bool,
}

/// Result of a whole download pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct DownloadOutcome {
    /// Successful chunks with their byte counts, in download-set order.
    pub succeeded: Vec<(ChunkEntry, u64)>,
    /// Failed chunks in the order they failed.
    pub failed: Vec<(ChunkId, PatchError)>,
    /// Chunks never started because the pass was aborted.
    pub skipped: Vec<ChunkId>,
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// Error to report for the stage: the first failure that was not a
    /// consequence of cancellation.
    pub fn stage_error(&self) -> Option<PatchError> {
        self.failed
            .iter()
            .find(|(_, e)| !e.is_cancelled())
            .or_else(|| self.failed.first())
            .map(|(_, e)| e.clone())
    }
}

/// Tracks a download pass over a [`ChunkDownloadSet`].
#[derive(Debug)]
pub(crate) struct DownloadCoordinator {
    set: ChunkDownloadSet,
    pending: VecDeque<ChunkEntry>,
    in_flight: HashSet<ChunkId>,
    records: HashMap<ChunkId, ChunkProgress>,
    bytes: HashMap<ChunkId, u64>,
    failed: Vec<(ChunkId, PatchError)>,
    skipped: Vec<ChunkId>,
    max_in_flight: usize,
    policy: FailurePolicy,
    aborted: bool,
}

impl DownloadCoordinator {
    pub fn new(set: ChunkDownloadSet, max_in_flight: usize, policy: FailurePolicy) -> Self {
        let records = set
            .entries()
            .iter()
            .map(|e| (e.id, ChunkProgress::new(e.id, e.size)))
            .collect();
        let pending = set.entries().iter().cloned().collect();

        Self {
            set,
            pending,
            in_flight: HashSet::new(),
            records,
            bytes: HashMap::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            max_in_flight: max_in_flight.max(1),
            policy,
            aborted: false,
        }
    }

    /// Next chunk to start, if the concurrency bound allows one.
    pub fn next_dispatch(&mut self) -> Option<ChunkEntry> {
        if self.aborted || self.in_flight.len() >= self.max_in_flight {
            return None;
        }
        let entry = self.pending.pop_front()?;
        self.in_flight.insert(entry.id);
        Some(entry)
    }

    /// Fold in a cumulative byte report for an in-flight chunk.
    pub fn on_progress(&mut self, chunk: ChunkId, bytes: u64, total: Option<u64>) -> ProgressDelta {
        if !self.in_flight.contains(&chunk) {
            return ProgressDelta::default();
        }
        match self.records.get_mut(&chunk) {
            Some(record) if !record.done => record.observe(bytes, total),
            _ => ProgressDelta::default(),
        }
    }

    /// Record a chunk's final outcome. Reports for chunks that are not in
    /// flight are ignored.
    pub fn on_finished(&mut self, chunk: ChunkId, result: PatchResult<u64>) -> Option<FinishedChunk> {
        if !self.in_flight.remove(&chunk) {
            return None;
        }
        let record = self.records.get_mut(&chunk)?;

        match result {
            Ok(bytes) => {
                let delta = record.finish(true, bytes);
                self.bytes.insert(chunk, bytes);
                debug!(chunk = %chunk, bytes, "Chunk downloaded");
                Some(FinishedChunk {
                    record: record.clone(),
                    delta,
                    error: None,
                    abort: false,
                })
            }
            Err(error) => {
                let delta = record.finish(false, 0);
                let record = record.clone();
                if !error.is_cancelled() {
                    warn!(chunk = %chunk, error = %error, "Chunk download failed");
                }
                self.failed.push((chunk, error.clone()));

                let abort = self.policy == FailurePolicy::FailFast && !self.aborted;
                if abort {
                    self.abort();
                }

                Some(FinishedChunk {
                    record,
                    delta,
                    error: Some(error),
                    abort,
                })
            }
        }
    }

    /// Stop starting new chunks. Pending chunks become skipped.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.skipped.extend(self.pending.drain(..).map(|e| e.id));
    }

    /// Whether every chunk has an outcome.
    pub fn is_finished(&self) -> bool {
        self.in_flight.is_empty() && self.pending.is_empty()
    }

    /// Chunks currently transferring.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn into_outcome(self) -> DownloadOutcome {
        let succeeded = self
            .set
            .entries()
            .iter()
            .filter_map(|e| self.bytes.get(&e.id).map(|b| (e.clone(), *b)))
            .collect();

        DownloadOutcome {
            succeeded,
            failed: self.failed,
            skipped: self.skipped,
        }
    }
}

/// Download one chunk, retrying per `retry`.
///
/// Cancellation is never retried. Progress reports from a retried transfer
/// restart from zero; [`ChunkProgress::observe`] absorbs the regression.
pub(crate) async fn download_with_retry(
    store: Arc<dyn ChunkStore>,
    entry: ChunkEntry,
    sink: ProgressSink,
    cancel: CancellationToken,
    retry: RetryPolicy,
) -> PatchResult<u64> {
    let mut attempt = 1;
    loop {
        let result = store
            .download_chunk(entry.clone(), sink.clone(), cancel.clone())
            .await;

        let error = match result {
            Err(error) if !error.is_cancelled() && !cancel.is_cancelled() => error,
            other => return other,
        };

        let Some(delay) = retry.delay_for_attempt(attempt) else {
            return Err(error);
        };

        warn!(
            chunk = %entry.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying chunk download"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PatchError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
