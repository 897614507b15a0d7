//! Patcher configuration.
//!
//! [`PatcherConfig`] is the runtime configuration handed to
//! [`Patcher::new`](crate::Patcher::new). [`ConfigFile`] is its persisted INI
//! form, edited by `chunkpatch config` and `chunkpatch init`.

mod file;

pub use file::{config_directory, config_file_path, ConfigError, ConfigFile, ConfigKey};

use std::path::PathBuf;

use crate::policy::{FailurePolicy, MountOrder, RetryPolicy};

/// Default number of simultaneous chunk downloads.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;

/// Default capacity of the progress broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Runtime configuration of a [`Patcher`](crate::Patcher).
#[derive(Debug, Clone)]
pub struct PatcherConfig {
    /// Deployment the content belongs to (e.g. `live`, `staging`).
    pub deployment_name: String,

    /// Platform the content is built for.
    pub platform_name: String,

    /// Maximum concurrent chunk downloads. Values below 1 are treated as 1.
    pub max_concurrent_downloads: usize,

    /// What the download stage does after a chunk fails.
    pub failure_policy: FailurePolicy,

    /// Per-chunk retry before a download counts as failed.
    pub retry: RetryPolicy,

    /// How downloaded chunks are mounted.
    pub mount_order: MountOrder,

    /// Free space that must remain after the download, in bytes.
    pub min_free_space: u64,

    /// Path whose filesystem is checked for free space.
    ///
    /// `None` skips the disk check.
    pub disk_check_path: Option<PathBuf>,

    /// Capacity of the progress channel. Progress receivers that fall
    /// further behind than this skip to newer updates.
    pub event_capacity: usize,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            deployment_name: "live".to_string(),
            platform_name: std::env::consts::OS.to_string(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            failure_policy: FailurePolicy::default(),
            retry: RetryPolicy::default(),
            mount_order: MountOrder::default(),
            min_free_space: 0,
            disk_check_path: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl PatcherConfig {
    /// Create a configuration for a deployment and platform.
    pub fn new(deployment_name: impl Into<String>, platform_name: impl Into<String>) -> Self {
        Self {
            deployment_name: deployment_name.into(),
            platform_name: platform_name.into(),
            ..Default::default()
        }
    }

    /// Set the maximum number of simultaneous downloads.
    pub fn with_max_concurrent_downloads(mut self, max: usize) -> Self {
        self.max_concurrent_downloads = max.max(1);
        self
    }

    /// Set the download failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the per-chunk retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the mount order.
    pub fn with_mount_order(mut self, order: MountOrder) -> Self {
        self.mount_order = order;
        self
    }

    /// Require free disk space before downloading.
    ///
    /// # Arguments
    ///
    /// * `path` - Any path on the filesystem that receives the chunks
    /// * `min_free_space` - Bytes that must remain free after the download
    pub fn with_disk_check(mut self, path: impl Into<PathBuf>, min_free_space: u64) -> Self {
        self.disk_check_path = Some(path.into());
        self.min_free_space = min_free_space;
        self
    }

    /// Set the progress channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Effective download concurrency.
    pub fn download_concurrency(&self) -> usize {
        self.max_concurrent_downloads.max(1)
    }
}
