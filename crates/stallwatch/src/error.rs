//! Error types for stallwatch

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors, rejected at construction (fail fast).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The poll interval must be non-zero for the monitor to make progress.
    #[error("poll interval must be non-zero")]
    ZeroPollInterval,

    /// The sample interval must be non-zero for the pressure monitor.
    #[error("sample interval must be non-zero")]
    ZeroSampleInterval,

    /// A threshold equal to or below the poll interval would trigger on a
    /// single sample.
    #[error(
        "stall threshold ({threshold_ms} ms) must be strictly greater than poll interval ({poll_ms} ms)"
    )]
    ThresholdNotAbovePoll { threshold_ms: u64, poll_ms: u64 },
}

/// Main error type for stallwatch
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors (thread spawn, log file creation)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
