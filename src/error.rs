//! Error types for clock-updater
//!
//! This module provides the error handling for the update pipeline, including:
//! - Transport failures reported by a [`StreamFetcher`](crate::fetch::StreamFetcher)
//! - Archive failures reported by the [`PackUnpacker`](crate::unpack::PackUnpacker)
//! - A crate-wide [`Error`] that every stage converts into a retry decision
//!
//! Nothing in this crate terminates the process on error; the pipeline logs the
//! failure and schedules the next attempt.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for clock-updater operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for clock-updater
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "update_url")
        key: Option<String>,
    },

    /// I/O error (disk full, missing directory, permission denied, ...)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network transfer failed
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Pack archive could not be unpacked
    #[error("unpack error: {0}")]
    Unpack(#[from] UnpackError),

    /// Malformed JSON document
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid URL (bad base URL in the configuration)
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Marker file could not be written or removed
    #[error("marker {marker} in {dir}: {source}")]
    Marker {
        /// Marker name (`@VALID` or `@ENABLED`)
        marker: &'static str,
        /// Pack directory the marker belongs to
        dir: PathBuf,
        /// Underlying filesystem error
        source: std::io::Error,
    },
}

impl Error {
    /// Returns true if the error is expected to go away on its own
    ///
    /// Transient failures (timeouts, resets, bad status) are logged at `warn`,
    /// everything else at `error`. Both resolve to a retry schedule.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Fetch(e) => e.is_transient(),
            Error::Unpack(UnpackError::Fetch(e)) => e.is_transient(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Config { .. }
            | Error::Unpack(_)
            | Error::Serialization(_)
            | Error::InvalidUrl(_)
            | Error::Marker { .. } => false,
        }
    }
}

/// Transport failure kinds reported by a byte stream
///
/// After any of these the transfer is abandoned and its connection is unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// No data arrived within the read timeout
    #[error("transfer timed out")]
    Timeout,

    /// Connection could not be established
    #[error("connection failed: {0}")]
    Connect(String),

    /// Connection dropped mid-transfer
    #[error("connection reset")]
    ConnectionReset,

    /// Server answered with a non-success status
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// Another transfer already holds the connection slot
    #[error("connection slot busy")]
    Busy,

    /// The fetcher already reported its terminal signal
    #[error("fetcher already closed")]
    Closed,

    /// Any other transport failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    /// Returns true for failures a later attempt can reasonably get past
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout
            | FetchError::Connect(_)
            | FetchError::ConnectionReset
            | FetchError::Busy
            | FetchError::Transport(_) => true,
            FetchError::Status(code) => *code >= 500 || *code == 408 || *code == 429,
            FetchError::Closed => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_connect() {
            FetchError::Connect(e.to_string())
        } else if let Some(status) = e.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

/// Pack archive errors
#[derive(Debug, Error)]
pub enum UnpackError {
    /// The underlying transfer failed
    #[error("pack transfer failed: {0}")]
    Fetch(#[from] FetchError),

    /// Stream ended in the middle of an entry
    #[error("archive truncated inside entry {entry}")]
    Truncated {
        /// Index of the incomplete entry (0-based)
        entry: usize,
    },

    /// Entry header is malformed
    #[error("invalid header for entry {entry}: {reason}")]
    InvalidHeader {
        /// Index of the offending entry (0-based)
        entry: usize,
        /// What was wrong with it
        reason: String,
    },

    /// Entry path escapes the install directory
    #[error("unsafe entry path {path:?}")]
    UnsafePath {
        /// The path as written in the archive
        path: String,
    },

    /// Writing an entry to disk failed
    #[error("failed to write {path}: {source}")]
    Io {
        /// File being written
        path: PathBuf,
        /// Underlying filesystem error
        source: std::io::Error,
    },
}
