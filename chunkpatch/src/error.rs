//! Error types for patching.
//!
//! [`PatchError`] is the stage-level taxonomy. Every variant is caught at the
//! stage that produced it, turned into that stage's `*Fail` transition and
//! recorded as text on the session. Callers of [`Patcher`](crate::Patcher)
//! only ever see the text, the stage stream and the final success flag.
//!
//! [`PatcherError`] covers misuse of the patcher handle itself (beginning a
//! patch before init, overlapping attempts, talking to a stopped patcher).

use thiserror::Error;

use crate::chunk::ChunkId;
use crate::state::PatchStage;

/// Result type for stage and collaborator operations.
pub type PatchResult<T> = Result<T, PatchError>;

/// Errors raised while running a patch attempt.
///
/// Payloads are plain strings so errors can be cloned across the task
/// boundary between collaborators and the coordinating actor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    /// Network or I/O failure in a collaborator (version fetch, chunk
    /// transfer, disk query).
    #[error("transport error ({target}): {reason}")]
    Transport { target: String, reason: String },

    /// The version descriptor payload is malformed.
    #[error("malformed version descriptor: {0}")]
    Parse(String),

    /// Local manifest state is corrupt, unreadable or could not be written.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// A downloaded chunk could not be mounted.
    #[error("failed to mount chunk {chunk}: {reason}")]
    Mount { chunk: ChunkId, reason: String },

    /// Not enough disk space to attempt the download.
    #[error("insufficient disk space: {required} bytes required, {available} bytes available")]
    Resource { required: u64, available: u64 },

    /// Work was aborted through cooperative cancellation.
    #[error("operation cancelled")]
    Cancelled,
}

impl PatchError {
    /// Transport error for a URL or chunk.
    pub fn transport(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Mount error for a chunk.
    pub fn mount(chunk: ChunkId, reason: impl Into<String>) -> Self {
        Self::Mount {
            chunk,
            reason: reason.into(),
        }
    }

    /// Whether this error came from cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type for [`Patcher`](crate::Patcher) handle operations.
pub type PatcherResult<T> = Result<T, PatcherError>;

/// Errors returned by the [`Patcher`](crate::Patcher) handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatcherError {
    /// `begin` was called before `init`.
    #[error("patching system is not initialized")]
    NotInitialized,

    /// `init` was called twice without an intervening shutdown.
    #[error("patching system already initialized with {url}")]
    AlreadyInitialized { url: String },

    /// A patch attempt is already running.
    #[error("a patch attempt is already in progress (stage {stage})")]
    AttemptInProgress { stage: PatchStage },

    /// The attempt was torn down by shutdown before it completed.
    #[error("patch attempt was cancelled")]
    Cancelled,

    /// The coordinating task is no longer running.
    #[error("patcher has stopped")]
    Stopped,

    /// An update preview could not be computed.
    #[error("update check failed: {0}")]
    Check(PatchError),
}
