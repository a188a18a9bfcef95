//! Error types for the source backend contract.
//!
//! Orchestration code works with `anyhow`; backends return [`SourceError`]
//! so callers can match the unsupported-operation sentinels structurally.

use thiserror::Error;

/// Result type alias for backend operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Errors a [`LogSource`](crate::traits::LogSource) can report.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The backend cannot serve byte-range reads (or the range policy forbids them).
    #[error("range not supported")]
    RangeNotSupported,

    /// The backend cannot serve whole-object streams.
    #[error("stream not supported")]
    StreamNotSupported,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH transport or SFTP protocol error.
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// Missing or rejected SFTP credentials.
    #[error("SFTP authentication failed: {0}")]
    Auth(String),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success response from the object store.
    #[error("S3 {operation} failed (HTTP {status}): {message}")]
    S3 {
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// Malformed glob pattern.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] globset::Error),

    /// Missing or inconsistent backend configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking backend task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
