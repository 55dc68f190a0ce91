//! Error types for bbqscan.
//!
//! Library crates use [`BbqScanError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all bbqscan operations.
#[derive(Debug, thiserror::Error)]
pub enum BbqScanError {
    /// Configuration loading or validation error, including a missing credential.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error that is not worth retrying (bad request, auth, TLS).
    #[error("network error: {0}")]
    Network(String),

    /// The remote capability asked us to slow down (HTTP 429).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The request did not complete in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The remote capability is temporarily unavailable (HTTP 5xx, connect failure).
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The remote capability answered, but the answer is unusable.
    #[error("capability error: {0}")]
    Capability(String),

    /// A batch or record broke the request/response contract (count mismatch,
    /// missing field). Never retried.
    #[error("contract violation: {message}")]
    Contract { message: String },

    /// A transient failure persisted through every allowed attempt.
    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<BbqScanError>,
    },

    /// Database or result table storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Converting a source document into page images failed.
    #[error("render error: {0}")]
    Render(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (missing column, invalid value, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Response or file parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BbqScanError>;

impl BbqScanError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a contract violation from any displayable message.
    pub fn contract(msg: impl Into<String>) -> Self {
        Self::Contract {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry with the same input could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Timeout(_) | Self::Unavailable(_)
        )
    }

    /// Whether the remote side answered but the answer cannot be used.
    pub fn is_unusable_answer(&self) -> bool {
        matches!(self, Self::Contract { .. } | Self::Capability(_))
    }
}
