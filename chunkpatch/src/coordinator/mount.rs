//! Mount coordinator.
//!
//! Mounts the chunks of a download pass that succeeded. In
//! [`MountOrder::Sequential`] mode chunks go one at a time and the first
//! failure skips the rest; in [`MountOrder::Concurrent`] mode up to
//! `max_in_flight` mounts run at once and every chunk is attempted.
//! Chunks that mounted before a failure stay mounted.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, warn};

use crate::chunk::ChunkId;
use crate::error::{PatchError, PatchResult};
use crate::policy::MountOrder;

/// Result of a mount pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct MountOutcome {
    pub mounted: Vec<ChunkId>,
    pub failed: Vec<(ChunkId, PatchError)>,
    pub skipped: Vec<ChunkId>,
}

impl MountOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub fn first_error(&self) -> Option<PatchError> {
        self.failed.first().map(|(_, e)| e.clone())
    }
}

#[derive(Debug)]
pub(crate) struct MountCoordinator {
    pending: VecDeque<ChunkId>,
    in_flight: HashSet<ChunkId>,
    max_in_flight: usize,
    stop_on_failure: bool,
    outcome: MountOutcome,
}

impl MountCoordinator {
    pub fn new(chunks: Vec<ChunkId>, order: MountOrder) -> Self {
        Self {
            pending: chunks.into(),
            in_flight: HashSet::new(),
            max_in_flight: order.max_in_flight(),
            stop_on_failure: order.stops_on_failure(),
            outcome: MountOutcome::default(),
        }
    }

    /// Next chunk to mount, if the ordering allows one now.
    pub fn next_dispatch(&mut self) -> Option<ChunkId> {
        if self.in_flight.len() >= self.max_in_flight {
            return None;
        }
        let chunk = self.pending.pop_front()?;
        self.in_flight.insert(chunk);
        Some(chunk)
    }

    /// Record a mount result. Returns `false` for chunks not in flight.
    pub fn on_finished(&mut self, chunk: ChunkId, result: PatchResult<()>) -> bool {
        if !self.in_flight.remove(&chunk) {
            return false;
        }

        match result {
            Ok(()) => {
                debug!(chunk = %chunk, "Chunk mounted");
                self.outcome.mounted.push(chunk);
            }
            Err(error) => {
                warn!(chunk = %chunk, error = %error, "Chunk mount failed");
                self.outcome.failed.push((chunk, error));
                if self.stop_on_failure {
                    self.outcome.skipped.extend(self.pending.drain(..));
                }
            }
        }
        true
    }

    pub fn is_finished(&self) -> bool {
        self.in_flight.is_empty() && self.pending.is_empty()
    }

    pub fn into_outcome(self) -> MountOutcome {
        self.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u32]) -> Vec<ChunkId> {
        raw.iter().copied().map(ChunkId).collect()
    }

    #[test]
    fn test_sequential_one_at_a_time() {
        let mut coordinator = MountCoordinator::new(ids(&[1, 2]), MountOrder::Sequential);

        assert_eq!(coordinator.next_dispatch(), Some(ChunkId(1)));
        assert_eq!(coordinator.next_dispatch(), None);

        assert!(coordinator.on_finished(ChunkId(1), Ok(())));
        assert_eq!(coordinator.next_dispatch(), Some(ChunkId(2)));
        coordinator.on_finished(ChunkId(2), Ok(()));

        assert!(coordinator.is_finished());
        let outcome = coordinator.into_outcome();
        assert!(outcome.is_success());
        assert_eq!(outcome.mounted, ids(&[1, 2]));
    }

    #[test]
    fn test_sequential_stops_at_first_failure() {
        let mut coordinator = MountCoordinator::new(ids(&[1, 2, 3]), MountOrder::Sequential);

        coordinator.next_dispatch();
        coordinator.on_finished(ChunkId(1), Ok(()));
        coordinator.next_dispatch();
        coordinator.on_finished(ChunkId(2), Err(PatchError::mount(ChunkId(2), "busy")));

        assert_eq!(coordinator.next_dispatch(), None);
        assert!(coordinator.is_finished());

        let outcome = coordinator.into_outcome();
        assert_eq!(outcome.mounted, ids(&[1]));
        assert_eq!(outcome.skipped, ids(&[3]));
        assert_eq!(outcome.first_error(), Some(PatchError::mount(ChunkId(2), "busy")));
    }

    #[test]
    fn test_concurrent_drains_after_failure() {
        let mut coordinator = MountCoordinator::new(ids(&[1, 2, 3]), MountOrder::concurrent(2));

        assert_eq!(coordinator.next_dispatch(), Some(ChunkId(1)));
        assert_eq!(coordinator.next_dispatch(), Some(ChunkId(2)));
        assert_eq!(coordinator.next_dispatch(), None);

        coordinator.on_finished(ChunkId(1), Err(PatchError::mount(ChunkId(1), "busy")));
        assert_eq!(coordinator.next_dispatch(), Some(ChunkId(3)));
        coordinator.on_finished(ChunkId(2), Ok(()));
        coordinator.on_finished(ChunkId(3), Ok(()));

        let outcome = coordinator.into_outcome();
        assert_eq!(outcome.mounted, ids(&[2, 3]));
        assert!(outcome.skipped.is_empty());
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_unknown_chunk_is_ignored() {
        let mut coordinator = MountCoordinator::new(ids(&[1]), MountOrder::Sequential);
        assert!(!coordinator.on_finished(ChunkId(9), Ok(())));
    }

    #[test]
    fn test_empty_is_finished() {
        let coordinator = MountCoordinator::new(Vec::new(), MountOrder::concurrent(4));
        assert!(coordinator.is_finished());
        assert!(coordinator.into_outcome().is_success());
    }
}
