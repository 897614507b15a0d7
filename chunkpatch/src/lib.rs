//! chunkpatch - client-side content patching
//!
//! Given a remote version descriptor, chunkpatch works out which content
//! chunks are stale, downloads them, records them in a local manifest and
//! mounts them for the running application, reporting progress throughout.
//!
//! The entry point is [`Patcher`]. Collaborators for the network, chunk
//! storage, manifest persistence and disk queries live in [`backend`].

pub mod backend;
pub mod chunk;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod logging;
pub mod manifest;
pub mod policy;
pub mod progress;
pub mod session;
pub mod state;

mod coordinator;
mod patcher;

pub use backend::{
    ChunkStore, DiskSpace, DiskSpaceProbe, ManifestStore, PatchBackend, ProgressSink,
    VersionSource,
};
pub use chunk::{ChunkEntry, ChunkId};
pub use config::PatcherConfig;
pub use descriptor::VersionDescriptor;
pub use error::{PatchError, PatchResult, PatcherError, PatcherResult};
pub use events::{PatchEvent, PatchEvents, ProgressUpdate};
pub use manifest::{ChunkDownloadSet, LocalManifest, LocalState, ManifestReconciler, Reconciliation};
pub use patcher::{PatchTicket, Patcher};
pub use policy::{FailurePolicy, MountOrder, RetryPolicy};
pub use progress::{AggregateProgress, ChunkProgress, PatchStats};
pub use state::PatchStage;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
