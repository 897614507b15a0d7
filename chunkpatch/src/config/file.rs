//! INI configuration file.
//!
//! Stored at `<config dir>/chunkpatch/config.ini`:
//!
//! ```ini
//! [patch]
//! version_url = https://cdn.example.com/live/version.json
//! deployment = live
//! platform = linux
//!
//! [download]
//! max_concurrent = 4
//! failure_policy = continue
//! retry_attempts = 1
//! retry_delay_ms = 250
//!
//! [mount]
//! order = sequential
//! max_concurrent = 4
//!
//! [storage]
//! base_url = https://cdn.example.com/live/chunks
//! chunk_dir = /home/user/.local/share/chunkpatch/chunks
//! mount_dir = /home/user/.local/share/chunkpatch/mounted
//! manifest_path = /home/user/.local/share/chunkpatch/manifest.json
//!
//! [disk]
//! min_free_mb = 512
//!
//! [logging]
//! level = info
//! file = /home/user/.local/share/chunkpatch/chunkpatch.log
//! ```
//!
//! Missing keys fall back to defaults; empty values mean "not set".

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use super::{PatcherConfig, DEFAULT_MAX_CONCURRENT_DOWNLOADS};
use crate::policy::{
    FailurePolicy, MountOrder, RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_DELAY_MS,
    DEFAULT_MAX_DELAY_SECS,
};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Errors reading or writing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    /// The file could not be written.
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The INI text is malformed.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// A value has the wrong type or is out of range.
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// A dotted key names no setting.
    #[error("unknown configuration key '{0}'")]
    UnknownKey(String),
}

/// `[patch]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSettings {
    /// URL of the remote version descriptor.
    pub version_url: Option<String>,
    pub deployment: String,
    pub platform: String,
}

/// `[download]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    pub max_concurrent: usize,
    pub failure_policy: FailurePolicy,
    /// Attempts per chunk including the first. 1 disables retry.
    pub retry_attempts: u32,
    /// Delay before the first retry; later retries back off exponentially.
    pub retry_delay_ms: u64,
}

/// `[mount]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSettings {
    /// `sequential` or `concurrent`.
    pub order: String,
    /// Bound for concurrent mounting.
    pub max_concurrent: usize,
}

/// `[storage]` section.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StorageSettings {
    /// Base URL chunks are downloaded from (`<base_url>/chunk_<id>.pak`).
    pub base_url: Option<String>,
    pub chunk_dir: Option<PathBuf>,
    pub mount_dir: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
}

/// `[disk]` section.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiskSettings {
    /// Free space to keep after downloading, in megabytes.
    pub min_free_mb: u64,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
    pub file: Option<PathBuf>,
}

/// Parsed configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub patch: PatchSettings,
    pub download: DownloadSettings,
    pub mount: MountSettings,
    pub storage: StorageSettings,
    pub disk: DiskSettings,
    pub logging: LoggingSettings,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            patch: PatchSettings {
                version_url: None,
                deployment: "live".to_string(),
                platform: std::env::consts::OS.to_string(),
            },
            download: DownloadSettings {
                max_concurrent: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
                failure_policy: FailurePolicy::default(),
                retry_attempts: 1,
                retry_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            },
            mount: MountSettings {
                order: "sequential".to_string(),
                max_concurrent: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            },
            storage: StorageSettings::default(),
            disk: DiskSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
                file: None,
            },
        }
    }
}

/// Directory holding the configuration file.
pub fn config_directory() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chunkpatch")
}

/// Path of the configuration file.
pub fn config_file_path() -> PathBuf {
    config_directory().join("config.ini")
}

/// Default data directory for chunks, mounts and the manifest.
fn data_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chunkpatch")
}

impl ConfigFile {
    /// Load from the default path. A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_file_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load from a specific file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Parse INI text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_ini(&ini)
    }

    /// Save to the default path, creating the directory if needed.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&config_file_path())
    }

    /// Save to a specific file.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        self.to_ini()
            .write_to_file(path)
            .map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for key in ConfigKey::all() {
            let value = ini
                .section(Some(key.section()))
                .and_then(|props| props.get(key.key_name()));
            if let Some(value) = value {
                key.set(&mut config, value)?;
            }
        }
        Ok(config)
    }

    fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        for key in ConfigKey::all() {
            ini.with_section(Some(key.section()))
                .set(key.key_name(), key.get(self));
        }
        ini
    }

    /// Chunk directory, defaulting under the local data directory.
    pub fn chunk_dir(&self) -> PathBuf {
        self.storage
            .chunk_dir
            .clone()
            .unwrap_or_else(|| data_directory().join("chunks"))
    }

    /// Mount directory, defaulting under the local data directory.
    pub fn mount_dir(&self) -> PathBuf {
        self.storage
            .mount_dir
            .clone()
            .unwrap_or_else(|| data_directory().join("mounted"))
    }

    /// Manifest path, defaulting under the local data directory.
    pub fn manifest_path(&self) -> PathBuf {
        self.storage
            .manifest_path
            .clone()
            .unwrap_or_else(|| data_directory().join("manifest.json"))
    }

    /// Retry policy described by the `[download]` section.
    pub fn retry_policy(&self) -> RetryPolicy {
        if self.download.retry_attempts <= 1 {
            return RetryPolicy::None;
        }
        RetryPolicy::ExponentialBackoff {
            max_attempts: self.download.retry_attempts,
            initial_delay: Duration::from_millis(self.download.retry_delay_ms),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Mount order described by the `[mount]` section.
    pub fn mount_order(&self) -> MountOrder {
        if self.mount.order.eq_ignore_ascii_case("concurrent") {
            MountOrder::concurrent(self.mount.max_concurrent)
        } else {
            MountOrder::Sequential
        }
    }

    /// Build the runtime configuration.
    ///
    /// The disk check runs against the chunk directory.
    pub fn to_patcher_config(&self) -> PatcherConfig {
        PatcherConfig::new(&self.patch.deployment, &self.patch.platform)
            .with_max_concurrent_downloads(self.download.max_concurrent)
            .with_failure_policy(self.download.failure_policy)
            .with_retry(self.retry_policy())
            .with_mount_order(self.mount_order())
            .with_disk_check(self.chunk_dir(), self.disk.min_free_mb * BYTES_PER_MB)
    }
}

/// A single setting, addressed as `section.key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    PatchVersionUrl,
    PatchDeployment,
    PatchPlatform,
    DownloadMaxConcurrent,
    DownloadFailurePolicy,
    DownloadRetryAttempts,
    DownloadRetryDelayMs,
    MountOrder,
    MountMaxConcurrent,
    StorageBaseUrl,
    StorageChunkDir,
    StorageMountDir,
    StorageManifestPath,
    DiskMinFreeMb,
    LoggingLevel,
    LoggingFile,
}

impl ConfigKey {
    /// Every key, grouped by section.
    pub fn all() -> &'static [ConfigKey] {
        use ConfigKey::*;
        &[
            PatchVersionUrl,
            PatchDeployment,
            PatchPlatform,
            DownloadMaxConcurrent,
            DownloadFailurePolicy,
            DownloadRetryAttempts,
            DownloadRetryDelayMs,
            MountOrder,
            MountMaxConcurrent,
            StorageBaseUrl,
            StorageChunkDir,
            StorageMountDir,
            StorageManifestPath,
            DiskMinFreeMb,
            LoggingLevel,
            LoggingFile,
        ]
    }

    /// INI section name.
    pub fn section(&self) -> &'static str {
        use ConfigKey::*;
        match self {
            PatchVersionUrl | PatchDeployment | PatchPlatform => "patch",
            DownloadMaxConcurrent
            | DownloadFailurePolicy
            | DownloadRetryAttempts
            | DownloadRetryDelayMs => "download",
            MountOrder | MountMaxConcurrent => "mount",
            StorageBaseUrl | StorageChunkDir | StorageMountDir | StorageManifestPath => "storage",
            DiskMinFreeMb => "disk",
            LoggingLevel | LoggingFile => "logging",
        }
    }

    /// Key name within the section.
    pub fn key_name(&self) -> &'static str {
        use ConfigKey::*;
        match self {
            PatchVersionUrl => "version_url",
            PatchDeployment => "deployment",
            PatchPlatform => "platform",
            DownloadMaxConcurrent | MountMaxConcurrent => "max_concurrent",
            DownloadFailurePolicy => "failure_policy",
            DownloadRetryAttempts => "retry_attempts",
            DownloadRetryDelayMs => "retry_delay_ms",
            MountOrder => "order",
            StorageBaseUrl => "base_url",
            StorageChunkDir => "chunk_dir",
            StorageMountDir => "mount_dir",
            StorageManifestPath => "manifest_path",
            DiskMinFreeMb => "min_free_mb",
            LoggingLevel => "level",
            LoggingFile => "file",
        }
    }

    /// Dotted name, e.g. `download.max_concurrent`.
    pub fn name(&self) -> String {
        format!("{}.{}", self.section(), self.key_name())
    }

    /// Current value as text. Unset optional values are empty.
    pub fn get(&self, config: &ConfigFile) -> String {
        use ConfigKey::*;
        fn path(p: &Option<PathBuf>) -> String {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        }

        match self {
            PatchVersionUrl => config.patch.version_url.clone().unwrap_or_default(),
            PatchDeployment => config.patch.deployment.clone(),
            PatchPlatform => config.patch.platform.clone(),
            DownloadMaxConcurrent => config.download.max_concurrent.to_string(),
            DownloadFailurePolicy => config.download.failure_policy.to_string(),
            DownloadRetryAttempts => config.download.retry_attempts.to_string(),
            DownloadRetryDelayMs => config.download.retry_delay_ms.to_string(),
            MountOrder => config.mount.order.clone(),
            MountMaxConcurrent => config.mount.max_concurrent.to_string(),
            StorageBaseUrl => config.storage.base_url.clone().unwrap_or_default(),
            StorageChunkDir => path(&config.storage.chunk_dir),
            StorageMountDir => path(&config.storage.mount_dir),
            StorageManifestPath => path(&config.storage.manifest_path),
            DiskMinFreeMb => config.disk.min_free_mb.to_string(),
            LoggingLevel => config.logging.level.clone(),
            LoggingFile => path(&config.logging.file),
        }
    }

    /// Parse and store a value.
    pub fn set(&self, config: &mut ConfigFile, value: &str) -> Result<(), ConfigError> {
        use ConfigKey::*;
        let value = value.trim();
        let optional = |v: &str| (!v.is_empty()).then(|| v.to_string());
        let optional_path = |v: &str| (!v.is_empty()).then(|| PathBuf::from(v));

        match self {
            PatchVersionUrl => config.patch.version_url = optional(value),
            PatchDeployment => config.patch.deployment = self.non_empty(value)?,
            PatchPlatform => config.patch.platform = self.non_empty(value)?,
            DownloadMaxConcurrent => config.download.max_concurrent = self.positive(value)?,
            DownloadFailurePolicy => {
                config.download.failure_policy = value
                    .parse()
                    .map_err(|reason| self.invalid(value, reason))?
            }
            DownloadRetryAttempts => {
                config.download.retry_attempts = self.positive(value)? as u32
            }
            DownloadRetryDelayMs => config.download.retry_delay_ms = self.number(value)?,
            MountOrder => {
                let order = value.to_lowercase();
                if order != "sequential" && order != "concurrent" {
                    return Err(self.invalid(value, "expected 'sequential' or 'concurrent'"));
                }
                config.mount.order = order;
            }
            MountMaxConcurrent => config.mount.max_concurrent = self.positive(value)?,
            StorageBaseUrl => config.storage.base_url = optional(value),
            StorageChunkDir => config.storage.chunk_dir = optional_path(value),
            StorageMountDir => config.storage.mount_dir = optional_path(value),
            StorageManifestPath => config.storage.manifest_path = optional_path(value),
            DiskMinFreeMb => config.disk.min_free_mb = self.number(value)?,
            LoggingLevel => {
                let level = value.to_lowercase();
                if !["trace", "debug", "info", "warn", "error"].contains(&level.as_str()) {
                    return Err(self.invalid(value, "expected trace, debug, info, warn or error"));
                }
                config.logging.level = level;
            }
            LoggingFile => config.logging.file = optional_path(value),
        }
        Ok(())
    }

    fn invalid(&self, value: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            key: self.name(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn non_empty(&self, value: &str) -> Result<String, ConfigError> {
        if value.is_empty() {
            return Err(self.invalid(value, "must not be empty"));
        }
        Ok(value.to_string())
    }

    fn number(&self, value: &str) -> Result<u64, ConfigError> {
        value
            .parse::<u64>()
            .map_err(|e| self.invalid(value, e.to_string()))
    }

    fn positive(&self, value: &str) -> Result<usize, ConfigError> {
        match value.parse::<usize>() {
            Ok(0) => Err(self.invalid(value, "must be at least 1")),
            Ok(n) => Ok(n),
            Err(e) => Err(self.invalid(value, e.to_string())),
        }
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        ConfigKey::all()
            .iter()
            .copied()
            .find(|key| key.name() == wanted)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section(), self.key_name())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_parse_empty_gives_defaults() {
        let config = ConfigFile::parse("").unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_parse_sections() {
        let text = "\
[patch]
version_url = https://cdn.example.com/version.json
deployment = staging

[download]
max_concurrent = 8
failure_policy = fail_fast
retry_attempts = 3
retry_delay_ms = 100

[mount]
order = concurrent
max_concurrent = 2

[disk]
min_free_mb = 10
";
        let config = ConfigFile::parse(text).unwrap();

        assert_eq!(
            config.patch.version_url.as_deref(),
            Some("https://cdn.example.com/version.json")
        );
        assert_eq!(config.patch.deployment, "staging");
        assert_eq!(config.download.max_concurrent, 8);
        assert_eq!(config.download.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.mount_order(), MountOrder::concurrent(2));
        assert_eq!(config.disk.min_free_mb, 10);

        let patcher = config.to_patcher_config();
        assert_eq!(patcher.max_concurrent_downloads, 8);
        assert_eq!(patcher.min_free_space, 10 * BYTES_PER_MB);
        assert_eq!(patcher.retry.max_attempts(), 3);
        assert_eq!(
            patcher.retry.delay_for_attempt(1),
            Some(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_parse_rejects_bad_number() {
        let err = ConfigFile::parse("[download]\nmax_concurrent = lots\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(err.to_string().contains("download.max_concurrent"));
    }

    #[test]
    fn test_parse_rejects_zero_concurrency() {
        assert!(ConfigFile::parse("[download]\nmax_concurrent = 0\n").is_err());
    }

    #[test]
    fn test_single_attempt_disables_retry() {
        assert_eq!(ConfigFile::default().retry_policy(), RetryPolicy::None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.ini");

        let mut config = ConfigFile::default();
        config.storage.base_url = Some("https://cdn.example.com/chunks".to_string());
        config.storage.chunk_dir = Some(dir.path().join("chunks"));
        config.save_to(&path).unwrap();

        let loaded = ConfigFile::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let err = ConfigFile::load_from(&dir.path().join("absent.ini")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_config_key_parse_and_name() {
        let key: ConfigKey = "download.failure_policy".parse().unwrap();
        assert_eq!(key, ConfigKey::DownloadFailurePolicy);
        assert_eq!(key.name(), "download.failure_policy");
        assert_eq!(key.to_string(), "download.failure_policy");
        assert!("download.speed".parse::<ConfigKey>().is_err());
    }

    #[test]
    fn test_config_key_names_are_unique() {
        let mut names: Vec<String> = ConfigKey::all().iter().map(|k| k.name()).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_config_key_set_and_get() {
        let mut config = ConfigFile::default();

        ConfigKey::LoggingLevel.set(&mut config, "DEBUG").unwrap();
        assert_eq!(ConfigKey::LoggingLevel.get(&config), "debug");

        ConfigKey::StorageMountDir.set(&mut config, "/srv/mount").unwrap();
        assert_eq!(ConfigKey::StorageMountDir.get(&config), "/srv/mount");

        ConfigKey::StorageMountDir.set(&mut config, "").unwrap();
        assert!(config.storage.mount_dir.is_none());

        assert!(ConfigKey::MountOrder.set(&mut config, "random").is_err());
        assert!(ConfigKey::PatchDeployment.set(&mut config, " ").is_err());
    }
}
