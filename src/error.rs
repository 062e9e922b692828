//! Error types for post-dl
//!
//! This module provides the error handling for the library:
//! - [`Error`] - crate-wide error; configuration and precondition variants are fatal to a run
//! - [`TransferError`] - per-file transfer failures, isolated to the file they belong to
//! - [`ExtractError`] - listing/detail API and payload normalization failures
//!
//! Retry classification lives in [`crate::retry::IsRetryable`].

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for post-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for post-dl
///
/// Each variant includes contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "queue_capacity")
        key: Option<String>,
    },

    /// The link does not point at a supported profile or post
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    /// The fetch-mode descriptor could not be parsed
    #[error("invalid fetch mode: {0}")]
    InvalidFetchMode(String),

    /// The initial profile summary could not be fetched, so no offsets can be planned
    #[error("failed to fetch profile summary for {link}: {reason}")]
    ProfileUnavailable {
        /// Profile link that was being resolved
        link: String,
        /// Last error reported by the fetch client
        reason: String,
    },

    /// Per-file transfer error
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Listing/detail API error
    #[error("extraction error: {0}")]
    Extract(#[from] ExtractError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The run was interrupted before the operation could start
    #[error("operation cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Errors raised while transferring a single file
#[derive(Debug, Error)]
pub enum TransferError {
    /// Server answered with a 4xx/5xx status
    #[error("HTTP {status} for {url}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// Server rejected the byte-range request (HTTP 416)
    #[error("range not satisfiable for {url} (requested from byte {offset})")]
    RangeNotSatisfiable {
        /// Requested URL
        url: String,
        /// First byte that was requested
        offset: u64,
    },

    /// Every attempt failed; the partial file is left on disk for a later run
    #[error("giving up on {url} after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        /// Requested URL
        url: String,
        /// Number of attempts made
        attempts: u32,
        /// Error reported by the final attempt
        last_error: String,
    },

    /// The partial file could not be moved into place
    #[error("failed to finalize {path}: {reason}")]
    Finalize {
        /// Final destination path
        path: PathBuf,
        /// The reason finalization failed
        reason: String,
    },
}

/// Errors raised by the listing/detail API client
#[derive(Debug, Error)]
pub enum ExtractError {
    /// API answered with a 4xx/5xx status
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// The payload did not have the expected shape
    #[error("malformed payload from {url}: {reason}")]
    Malformed {
        /// Requested URL
        url: String,
        /// What was missing or unexpected
        reason: String,
    },

    /// Detail endpoint kept answering 403 after all attempts
    #[error("rate limited fetching post {post_id}")]
    RateLimited {
        /// Post whose detail could not be fetched
        post_id: String,
    },
}

impl Error {
    /// Shorthand for a configuration error tied to a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }

    /// Whether this error must abort the whole run rather than a single file or page
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config { .. }
                | Error::UnsupportedSource(_)
                | Error::InvalidFetchMode(_)
                | Error::ProfileUnavailable { .. }
        )
    }
}
