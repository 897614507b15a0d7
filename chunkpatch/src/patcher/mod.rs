//! The patcher handle.
//!
//! [`Patcher`] is a cheap handle to a coordinating task that owns all patch
//! state. Calls send a command and wait for the task's reply. Observation
//! goes through a lossless stream of [`PatchEvent`](crate::PatchEvent)s per subscriber, a
//! broadcast channel of cumulative [`ProgressUpdate`]s and a pull-based
//! [`PatchStats`] snapshot.
//!
//! # Example
//!
//! ```ignore
//! use chunkpatch::{Patcher, PatcherConfig, PatchBackend};
//!
//! let patcher = Patcher::new(PatcherConfig::default(), backend);
//! let mut events = patcher.subscribe();
//!
//! patcher.init("https://cdn.example.com/live/version.json").await?;
//! let ticket = patcher.begin().await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//!     if matches!(event, PatchEvent::Completed { .. }) {
//!         break;
//!     }
//! }
//! let succeeded = ticket.wait().await?;
//! ```

mod actor;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::backend::PatchBackend;
use crate::config::PatcherConfig;
use crate::error::{PatcherError, PatcherResult};
use crate::events::{EventHub, PatchEvents, ProgressUpdate};
use crate::manifest::Reconciliation;
use crate::progress::PatchStats;

use actor::{Actor, Command};

/// Capacity of the command channel between handle and task.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Handle to a running patching system.
///
/// Dropping the last handle stops the coordinating task and cancels any
/// in-flight attempt.
#[derive(Debug)]
pub struct Patcher {
    commands: mpsc::Sender<Command>,
    events: EventHub,
    progress: broadcast::Sender<ProgressUpdate>,
    status: watch::Receiver<PatchStats>,
    backend: PatchBackend,
}

impl Patcher {
    /// Spawn the coordinating task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: PatcherConfig, backend: PatchBackend) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (stage_tx, stage_rx) = mpsc::unbounded_channel();
        let events = EventHub::default();
        let (progress, _) = broadcast::channel(config.event_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(PatchStats::default());

        let actor = Actor::new(
            config,
            backend.clone(),
            events.clone(),
            progress.clone(),
            status_tx,
            stage_tx,
        );
        tokio::spawn(actor.run(command_rx, stage_rx));

        Self {
            commands: command_tx,
            events,
            progress,
            status: status_rx,
            backend,
        }
    }

    /// Store the version URL. No network traffic happens until [`begin`](Self::begin).
    ///
    /// # Errors
    ///
    /// [`PatcherError::AlreadyInitialized`] if called again without a
    /// [`shutdown`](Self::shutdown) in between. The first URL is kept.
    pub async fn init(&self, version_url: impl Into<String>) -> PatcherResult<()> {
        let url = version_url.into();
        self.request(|reply| Command::Init { url, reply }).await?
    }

    /// Start a patch attempt.
    ///
    /// Returns once the attempt has entered `VersionDownload_Start`; the
    /// returned ticket resolves when it finishes.
    ///
    /// # Errors
    ///
    /// [`PatcherError::NotInitialized`] before [`init`](Self::init) and
    /// [`PatcherError::AttemptInProgress`] while another attempt runs.
    pub async fn begin(&self) -> PatcherResult<PatchTicket> {
        let (attempt, completion) = self.request(|reply| Command::Begin { reply }).await??;
        Ok(PatchTicket {
            attempt,
            completion,
        })
    }

    /// Cancel any in-flight attempt and return to `Idle`.
    ///
    /// Safe to call from any state. Events and completions of the cancelled
    /// attempt are discarded; its ticket resolves to
    /// [`PatcherError::Cancelled`]. A new [`init`](Self::init) is required
    /// before the next attempt.
    pub async fn shutdown(&self) -> PatcherResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Receive every stage, chunk and completion event from now on.
    ///
    /// Nothing is dropped however slowly the stream is read.
    pub fn subscribe(&self) -> PatchEvents {
        self.events.subscribe()
    }

    /// Receive progress updates from now on.
    ///
    /// Updates carry running totals. A receiver that falls more than
    /// `event_capacity` updates behind gets `RecvError::Lagged` and resumes
    /// at a newer update.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.progress.subscribe()
    }

    /// Latest status snapshot.
    pub fn status(&self) -> PatchStats {
        self.status.borrow().clone()
    }

    /// Watch channel of status snapshots, for UIs that poll on change.
    pub fn watch_status(&self) -> watch::Receiver<PatchStats> {
        self.status.clone()
    }

    /// Compute what an attempt would download, without downloading.
    ///
    /// Runs in the caller's task and does not change the session.
    ///
    /// # Errors
    ///
    /// [`PatcherError::NotInitialized`] before [`init`](Self::init) and
    /// [`PatcherError::Check`] when fetching, parsing or reading local state
    /// fails.
    pub async fn preview_patch(&self) -> PatcherResult<Reconciliation> {
        let url = self
            .request(|reply| Command::VersionUrl { reply })
            .await?
            .ok_or(PatcherError::NotInitialized)?;

        actor::preview(&self.backend, &url)
            .await
            .map_err(PatcherError::Check)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> PatcherResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| PatcherError::Stopped)?;
        reply_rx.await.map_err(|_| PatcherError::Stopped)
    }
}

/// Completion handle for one attempt.
#[derive(Debug)]
pub struct PatchTicket {
    attempt: u64,
    completion: oneshot::Receiver<bool>,
}

impl PatchTicket {
    /// Id of the attempt, matching [`PatchEvent::attempt`](crate::PatchEvent::attempt).
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Wait for the attempt to finish.
    ///
    /// Returns `Ok(true)` when it reached `Complete` and `Ok(false)` when a
    /// stage failed.
    ///
    /// # Errors
    ///
    /// [`PatcherError::Cancelled`] if the attempt was shut down first.
    pub async fn wait(self) -> PatcherResult<bool> {
        self.completion.await.map_err(|_| PatcherError::Cancelled)
    }
}
