//! Patch session state.
//!
//! A [`PatchSession`] is owned by the patcher's coordinating task and only
//! changes through checked stage transitions. It is restarted at the beginning
//! of every attempt and reset to `Idle` on shutdown.

use crate::chunk::ChunkId;
use crate::error::PatchError;
use crate::state::{PatchStage, TransitionError};

/// Identity and progress of the current patch attempt.
#[derive(Debug, Clone)]
pub struct PatchSession {
    /// Deployment the content belongs to.
    pub deployment_name: String,
    /// Platform the content is built for.
    pub platform_name: String,
    build_id: Option<String>,
    stage: PatchStage,
    error: Option<String>,
    pending: Vec<ChunkId>,
    attempt: Option<u64>,
}

impl PatchSession {
    /// Create an idle session.
    pub fn new(deployment_name: impl Into<String>, platform_name: impl Into<String>) -> Self {
        Self {
            deployment_name: deployment_name.into(),
            platform_name: platform_name.into(),
            build_id: None,
            stage: PatchStage::Idle,
            error: None,
            pending: Vec::new(),
            attempt: None,
        }
    }

    /// Current stage.
    pub fn stage(&self) -> PatchStage {
        self.stage
    }

    /// Build id from the last parsed descriptor of this attempt.
    pub fn build_id(&self) -> Option<&str> {
        self.build_id.as_deref()
    }

    /// Error text recorded by the last failed stage.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Chunks still waiting to download, in download order.
    pub fn pending_chunks(&self) -> &[ChunkId] {
        &self.pending
    }

    /// Id of the running or last attempt.
    pub fn attempt(&self) -> Option<u64> {
        self.attempt
    }

    /// Whether an attempt is running.
    pub fn is_in_flight(&self) -> bool {
        self.stage.is_in_flight()
    }

    /// Start a new attempt at `VersionDownload_Start`.
    ///
    /// Clears the previous attempt's build id, error and pending list.
    pub fn restart(&mut self, attempt: u64) -> Result<PatchStage, TransitionError> {
        let next = self.stage.transition_to(PatchStage::VersionDownloadStart)?;
        self.stage = next;
        self.attempt = Some(attempt);
        self.build_id = None;
        self.error = None;
        self.pending.clear();
        Ok(next)
    }

    /// Move to the next stage.
    pub fn transition(&mut self, next: PatchStage) -> Result<PatchStage, TransitionError> {
        self.stage = self.stage.transition_to(next)?;
        Ok(self.stage)
    }

    /// Move to a `*Fail` stage and record the error text.
    pub fn fail(&mut self, stage: PatchStage, error: &PatchError) -> Result<PatchStage, TransitionError> {
        debug_assert!(stage.is_failure());
        let stage = self.transition(stage)?;
        self.error = Some(error.to_string());
        Ok(stage)
    }

    /// Record the build id of the parsed descriptor.
    pub fn set_build_id(&mut self, build_id: impl Into<String>) {
        self.build_id = Some(build_id.into());
    }

    /// Replace the pending download list.
    pub fn set_pending(&mut self, chunks: Vec<ChunkId>) {
        self.pending = chunks;
    }

    /// Drop a chunk from the pending list once it has downloaded.
    pub fn mark_downloaded(&mut self, chunk: ChunkId) {
        self.pending.retain(|id| *id != chunk);
    }

    /// Return to `Idle`, forgetting the attempt.
    pub fn reset(&mut self) {
        self.stage = PatchStage::Idle;
        self.build_id = None;
        self.error = None;
        self.pending.clear();
        self.attempt = None;
    }
}
