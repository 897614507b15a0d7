//! Logging setup.
//!
//! Installs a `tracing` subscriber with:
//!
//! - an [`EnvFilter`] built from `RUST_LOG`, falling back to the configured level
//! - a stderr formatter with local timestamps
//! - optionally, a non-blocking file writer
//!
//! Keep the returned [`LoggingGuard`] alive for the lifetime of the program;
//! dropping it flushes buffered file output.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default log file name when a directory is given.
pub const DEFAULT_LOG_FILE: &str = "chunkpatch.log";

/// Errors installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log directory could not be created.
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A global subscriber is already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Keeps the file writer alive. Flushes on drop.
#[derive(Debug, Default)]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// # Arguments
///
/// * `level` - Default filter directive when `RUST_LOG` is unset (e.g. `info`)
/// * `log_file` - Optional file to append logs to, in addition to stderr
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<LoggingGuard, LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(LocalTime::rfc_3339())
        .with_target(false);

    let (file_layer, file_guard) = match log_file {
        Some(path) => {
            let (dir, name) = split_log_path(path);
            std::fs::create_dir_all(&dir).map_err(|source| LoggingError::CreateDir {
                path: dir.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTime::rfc_3339());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(LoggingGuard { _file: file_guard })
}

/// Split a log path into directory and file name. A path without a file
/// name gets [`DEFAULT_LOG_FILE`].
fn split_log_path(path: &Path) -> (PathBuf, String) {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let dir = if parent.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                parent.to_path_buf()
            };
            (dir, name.to_string_lossy().into_owned())
        }
        _ => (path.to_path_buf(), DEFAULT_LOG_FILE.to_string()),
    }
}
