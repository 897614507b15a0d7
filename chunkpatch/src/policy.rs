//! Policies controlling the download and mount stages.
//!
//! - [`FailurePolicy`]: what the download coordinator does after a chunk fails
//! - [`RetryPolicy`]: whether a failed chunk is retried before it counts as failed
//! - [`MountOrder`]: sequential or concurrent mounting
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use chunkpatch::policy::{FailurePolicy, MountOrder, RetryPolicy};
//!
//! let failure = FailurePolicy::FailFast;
//! let retry = RetryPolicy::fixed(3, Duration::from_millis(250));
//! let mount = MountOrder::concurrent(4);
//!
//! assert_eq!(retry.max_attempts(), 3);
//! assert_eq!(mount.max_in_flight(), 4);
//! # let _ = failure;
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default initial delay for exponential backoff (250ms).
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 250;

/// Default maximum delay for exponential backoff (30 seconds).
pub const DEFAULT_MAX_DELAY_SECS: u64 = 30;

/// Default multiplier for exponential backoff.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// What happens to the rest of a download pass after a chunk fails.
///
/// Either way the stage result is failure; the policy only decides how much
/// work is still done.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Let every chunk run to its own outcome.
    ///
    /// In-flight and queued chunks keep going, so every successful chunk is
    /// recorded in the manifest and skipped by the next attempt.
    #[default]
    ContinueOnError,

    /// Stop at the first failure.
    ///
    /// Queued chunks are never started and in-flight chunks are asked to
    /// abort.
    FailFast,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "continue" | "drain" | "continue_on_error" => Ok(Self::ContinueOnError),
            "fail_fast" | "failfast" | "eager" => Ok(Self::FailFast),
            other => Err(format!("unknown failure policy '{}'", other)),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContinueOnError => write!(f, "continue"),
            Self::FailFast => write!(f, "fail_fast"),
        }
    }
}

/// How a chunk download handles transient failures.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RetryPolicy {
    /// Fail on the first error.
    #[default]
    None,

    /// Retry with a constant delay.
    Fixed {
        /// Maximum number of attempts (including the initial attempt).
        max_attempts: u32,
        /// Delay between attempts.
        delay: Duration,
    },

    /// Retry with a doubling delay.
    ExponentialBackoff {
        /// Maximum number of attempts (including the initial attempt).
        max_attempts: u32,
        /// Delay after the first failure.
        initial_delay: Duration,
        /// Delay cap.
        max_delay: Duration,
        /// Multiplier applied after each failure.
        multiplier: f64,
    },
}

impl RetryPolicy {
    /// Exponential backoff with the default delays.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum number of attempts (including initial)
    pub fn exponential(max_attempts: u32) -> Self {
        Self::ExponentialBackoff {
            max_attempts,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Fixed delay between attempts.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum number of attempts (including initial)
    /// * `delay` - Delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed {
            max_attempts,
            delay,
        }
    }

    /// Delay before retry number `attempt` (1 is the first retry), or `None`
    /// once attempts are exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed {
                max_attempts,
                delay,
            } => (attempt < *max_attempts).then_some(*delay),
            Self::ExponentialBackoff {
                max_attempts,
                initial_delay,
                max_delay,
                multiplier,
            } => {
                if attempt >= *max_attempts {
                    return None;
                }
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let delay_ms = initial_delay.as_millis() as f64 * factor;
                let capped = delay_ms.min(max_delay.as_millis() as f64) as u64;
                Some(Duration::from_millis(capped))
            }
        }
    }

    /// Maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } => (*max_attempts).max(1),
            Self::ExponentialBackoff { max_attempts, .. } => (*max_attempts).max(1),
        }
    }
}

/// How successfully downloaded chunks are mounted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MountOrder {
    /// One chunk at a time in descriptor order; stops at the first failure.
    ///
    /// Safe when later chunks depend on content from earlier ones.
    #[default]
    Sequential,

    /// Up to `max_in_flight` mounts at once; every chunk is attempted.
    Concurrent {
        /// Maximum simultaneous mounts (at least 1).
        max_in_flight: usize,
    },
}

impl MountOrder {
    /// Concurrent mounting with the given bound.
    pub fn concurrent(max_in_flight: usize) -> Self {
        Self::Concurrent {
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Maximum simultaneous mounts.
    pub fn max_in_flight(&self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Concurrent { max_in_flight } => (*max_in_flight).max(1),
        }
    }

    /// Whether a failure stops the remaining mounts.
    pub fn stops_on_failure(&self) -> bool {
        matches!(self, Self::Sequential)
    }
}
