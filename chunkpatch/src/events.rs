//! Patcher events.
//!
//! [`PatchEvent`] is what subscribers see. Each subscriber owns an unbounded
//! queue, so stage, chunk and completion events are never dropped for a slow
//! reader. [`ProgressUpdate`]s are cumulative and travel separately on a
//! bounded broadcast channel, where a lagging reader just skips ahead.
//!
//! [`StageEvent`] is the internal message stage tasks send back to the
//! coordinating task; every variant carries the attempt id so results of a
//! torn-down attempt can be dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::chunk::ChunkId;
use crate::error::PatchResult;
use crate::manifest::LocalState;
use crate::progress::{AggregateProgress, ChunkProgress};
use crate::state::PatchStage;

/// Lifecycle event delivered to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchEvent {
    /// The session entered a new stage. Sent before the stage's work starts.
    StageChanged { attempt: u64, stage: PatchStage },

    /// One chunk reached its final download outcome.
    ChunkFinished {
        attempt: u64,
        progress: ChunkProgress,
    },

    /// The attempt finished. Sent exactly once per attempt that was not
    /// shut down.
    Completed { attempt: u64, succeeded: bool },
}

impl PatchEvent {
    /// Attempt the event belongs to.
    pub fn attempt(&self) -> u64 {
        match self {
            PatchEvent::StageChanged { attempt, .. }
            | PatchEvent::ChunkFinished { attempt, .. }
            | PatchEvent::Completed { attempt, .. } => *attempt,
        }
    }

    /// The stage, for `StageChanged` events.
    pub fn stage(&self) -> Option<PatchStage> {
        match self {
            PatchEvent::StageChanged { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Aggregate progress moved forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub attempt: u64,
    pub progress: AggregateProgress,
}

/// One subscriber's stream of [`PatchEvent`]s.
#[derive(Debug)]
pub struct PatchEvents {
    rx: mpsc::UnboundedReceiver<PatchEvent>,
}

impl PatchEvents {
    /// Next event, or `None` once the patcher task has stopped.
    pub async fn recv(&mut self) -> Option<PatchEvent> {
        self.rx.recv().await
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<PatchEvent> {
        self.rx.try_recv().ok()
    }
}

/// Fans lifecycle events out to every live subscriber.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventHub {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<PatchEvent>>>>,
}

impl EventHub {
    pub fn subscribe(&self) -> PatchEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        PatchEvents { rx }
    }

    /// Deliver to every subscriber, forgetting those that were dropped.
    pub fn publish(&self, event: &PatchEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Result of stage work, reported back to the coordinating task.
#[derive(Debug)]
pub(crate) struct StageEvent {
    pub attempt: u64,
    pub kind: StageEventKind,
}

#[derive(Debug)]
pub(crate) enum StageEventKind {
    VersionFetched(PatchResult<Vec<u8>>),
    LocalStateLoaded(PatchResult<LocalState>),
    DownloadProgress {
        chunk: ChunkId,
        bytes: u64,
        total: Option<u64>,
    },
    DownloadFinished {
        chunk: ChunkId,
        result: PatchResult<u64>,
    },
    ManifestCommitted(PatchResult<()>),
    MountFinished {
        chunk: ChunkId,
        result: PatchResult<()>,
    },
}

impl StageEvent {
    pub fn new(attempt: u64, kind: StageEventKind) -> Self {
        Self { attempt, kind }
    }
}
