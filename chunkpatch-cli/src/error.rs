//! CLI error types.

use std::fmt;

use chunkpatch::config::ConfigError;
use chunkpatch::logging::LoggingError;
use chunkpatch::{PatchError, PatchStage, PatcherError};

/// Errors reported by CLI commands.
#[derive(Debug)]
pub enum CliError {
    /// Configuration is missing or invalid.
    Config(String),

    /// The configuration file could not be read or written.
    ConfigFile(ConfigError),

    /// Logging could not be set up.
    Logging(LoggingError),

    /// A collaborator could not be created or queried.
    Backend(PatchError),

    /// The patcher rejected a request.
    Patcher(PatcherError),

    /// The patch attempt ended in a failed stage.
    PatchFailed {
        stage: PatchStage,
        reason: Option<String>,
    },

    /// Failed to create the Tokio runtime.
    RuntimeCreation(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::ConfigFile(e) => write!(f, "Configuration file error: {}", e),
            CliError::Logging(e) => write!(f, "Logging error: {}", e),
            CliError::Backend(e) => write!(f, "{}", e),
            CliError::Patcher(e) => write!(f, "{}", e),
            CliError::PatchFailed { stage, reason } => match reason {
                Some(reason) => write!(f, "Patch failed at {}: {}", stage, reason),
                None => write!(f, "Patch failed at {}", stage),
            },
            CliError::RuntimeCreation(msg) => write!(f, "Failed to create Tokio runtime: {}", msg),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::ConfigFile(e) => Some(e),
            CliError::Logging(e) => Some(e),
            CliError::Backend(e) => Some(e),
            CliError::Patcher(e) => Some(e),
            CliError::Config(_) | CliError::PatchFailed { .. } | CliError::RuntimeCreation(_) => {
                None
            }
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::ConfigFile(e)
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        CliError::Logging(e)
    }
}

impl From<PatchError> for CliError {
    fn from(e: PatchError) -> Self {
        CliError::Backend(e)
    }
}

impl From<PatcherError> for CliError {
    fn from(e: PatcherError) -> Self {
        CliError::Patcher(e)
    }
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::PatchFailed { .. } => 2,
            _ => 1,
        }
    }
}
