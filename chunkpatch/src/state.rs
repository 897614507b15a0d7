//! Patch stages and the transitions between them.
//!
//! A patch attempt walks a strictly forward sequence of stages. Each working
//! stage can branch to its own `*Fail` stage; every `*Fail` stage and
//! [`PatchStage::Complete`] is terminal for the attempt.
//!
//! ```text
//! Idle
//!  └─► VersionDownload_Start ─► VersionDownload_Succeed ─► VersionParse_Succeed
//!        └─► VersionDownload_Fail      └─► VersionParse_Fail        │
//!                                                                   ▼
//!      ManifestUpdate_Start ─► ManifestUpdate_Succeed ─► ChunkDownload_Start
//!        └─► ManifestUpdate_Fail                           ├─► ChunkDownload_Succeed
//!                                                          └─► ChunkDownload_Fail
//!      Mount_Start ─► Mount_Succeed ─► Complete
//!        └─► Mount_Fail
//! ```
//!
//! A terminal stage may only move to `VersionDownload_Start`, which begins a
//! fresh attempt.

use std::fmt;

/// Stage of a patch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PatchStage {
    /// No attempt has started since init or shutdown.
    #[default]
    Idle,

    VersionDownloadStart,
    VersionDownloadSucceed,
    VersionDownloadFail,

    VersionParseSucceed,
    VersionParseFail,

    ManifestUpdateStart,
    ManifestUpdateSucceed,
    ManifestUpdateFail,

    ChunkDownloadStart,
    ChunkDownloadSucceed,
    ChunkDownloadFail,

    MountStart,
    MountSucceed,
    MountFail,

    /// Every stage succeeded.
    Complete,
}

/// Rejected stage transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid stage transition {from} -> {to}")]
pub struct TransitionError {
    pub from: PatchStage,
    pub to: PatchStage,
}

impl PatchStage {
    /// Every stage in canonical order.
    ///
    /// The stages emitted by one attempt always appear in this order, with
    /// the stages of untaken branches skipped.
    pub const CANONICAL_ORDER: [PatchStage; 16] = [
        PatchStage::Idle,
        PatchStage::VersionDownloadStart,
        PatchStage::VersionDownloadSucceed,
        PatchStage::VersionDownloadFail,
        PatchStage::VersionParseSucceed,
        PatchStage::VersionParseFail,
        PatchStage::ManifestUpdateStart,
        PatchStage::ManifestUpdateSucceed,
        PatchStage::ManifestUpdateFail,
        PatchStage::ChunkDownloadStart,
        PatchStage::ChunkDownloadSucceed,
        PatchStage::ChunkDownloadFail,
        PatchStage::MountStart,
        PatchStage::MountSucceed,
        PatchStage::MountFail,
        PatchStage::Complete,
    ];

    /// Position of this stage in [`CANONICAL_ORDER`](Self::CANONICAL_ORDER).
    pub fn ordinal(self) -> usize {
        Self::CANONICAL_ORDER
            .iter()
            .position(|stage| *stage == self)
            .unwrap_or(0)
    }

    /// Stages reachable in one step from this stage.
    pub fn successors(self) -> &'static [PatchStage] {
        use PatchStage::*;
        match self {
            Idle => &[VersionDownloadStart],
            VersionDownloadStart => &[VersionDownloadSucceed, VersionDownloadFail],
            VersionDownloadSucceed => &[VersionParseSucceed, VersionParseFail],
            VersionParseSucceed => &[ManifestUpdateStart],
            ManifestUpdateStart => &[ManifestUpdateSucceed, ManifestUpdateFail],
            ManifestUpdateSucceed => &[ChunkDownloadStart],
            ChunkDownloadStart => &[ChunkDownloadSucceed, ChunkDownloadFail],
            ChunkDownloadSucceed => &[MountStart],
            MountStart => &[MountSucceed, MountFail],
            MountSucceed => &[Complete],
            // Terminal stages only allow a new attempt.
            VersionDownloadFail | VersionParseFail | ManifestUpdateFail | ChunkDownloadFail
            | MountFail | Complete => &[VersionDownloadStart],
        }
    }

    /// Validate a move to `next`.
    pub fn transition_to(self, next: PatchStage) -> Result<PatchStage, TransitionError> {
        if self.successors().contains(&next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }

    /// Whether the attempt stops advancing at this stage.
    pub fn is_terminal(self) -> bool {
        self == PatchStage::Complete || self.is_failure()
    }

    /// Whether this is one of the `*Fail` stages.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            PatchStage::VersionDownloadFail
                | PatchStage::VersionParseFail
                | PatchStage::ManifestUpdateFail
                | PatchStage::ChunkDownloadFail
                | PatchStage::MountFail
        )
    }

    /// Whether an attempt is running (neither idle nor terminal).
    pub fn is_in_flight(self) -> bool {
        self != PatchStage::Idle && !self.is_terminal()
    }

    /// Stable display name, e.g. `ChunkDownload_Start`.
    pub fn name(self) -> &'static str {
        use PatchStage::*;
        match self {
            Idle => "Idle",
            VersionDownloadStart => "VersionDownload_Start",
            VersionDownloadSucceed => "VersionDownload_Succeed",
            VersionDownloadFail => "VersionDownload_Fail",
            VersionParseSucceed => "VersionParse_Succeed",
            VersionParseFail => "VersionParse_Fail",
            ManifestUpdateStart => "ManifestUpdate_Start",
            ManifestUpdateSucceed => "ManifestUpdate_Succeed",
            ManifestUpdateFail => "ManifestUpdate_Fail",
            ChunkDownloadStart => "ChunkDownload_Start",
            ChunkDownloadSucceed => "ChunkDownload_Succeed",
            ChunkDownloadFail => "ChunkDownload_Fail",
            MountStart => "Mount_Start",
            MountSucceed => "Mount_Succeed",
            MountFail => "Mount_Fail",
            Complete => "Complete",
        }
    }
}

impl fmt::Display for PatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
