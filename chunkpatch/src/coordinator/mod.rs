//! Download and mount bookkeeping for one patch attempt.
//!
//! Coordinators are plain state holders owned by the patcher's actor task.
//! They decide what to dispatch next and fold results back in; the actor
//! spawns the actual collaborator calls.

mod download;
mod mount;

pub(crate) use download::{download_with_retry, DownloadCoordinator, DownloadOutcome};
pub(crate) use mount::MountCoordinator;
