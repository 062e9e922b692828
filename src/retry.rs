//! Retry logic with exponential backoff
//!
//! Every network call in the crate goes through [`download_with_retry`]. The delay
//! after the failed attempt with zero-based index `n` is `backoff_factor * 2^n`
//! (or `backoff_factor * (n + 1)` with [`Backoff::Linear`]), scaled by the error's
//! [`IsRetryable::backoff_multiplier`], capped at `max_delay`, with optional jitter.
//!
//! # Example
//!
//! ```no_run
//! use post_dl::retry::{IsRetryable, download_with_retry};
//! use post_dl::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! download_with_retry(&config, || async {
//!     Ok::<_, MyError>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{Backoff, RetryConfig};
use crate::error::{Error, ExtractError, TransferError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, HTTP errors, connection reset) return `true`.
/// Configuration and precondition failures return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;

    /// Factor applied to the backoff delay before retrying after this error
    fn backoff_multiplier(&self) -> u32 {
        1
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => is_transient_network(e),
            Error::Io(e) => is_transient_io(e),
            Error::Transfer(e) => e.is_retryable(),
            Error::Extract(e) => e.is_retryable(),
            // Fatal preconditions
            Error::Config { .. }
            | Error::UnsupportedSource(_)
            | Error::InvalidFetchMode(_)
            | Error::ProfileUnavailable { .. } => false,
            Error::Serialization(_) => false,
            Error::Cancelled => false,
            Error::Other(_) => false,
        }
    }

    fn backoff_multiplier(&self) -> u32 {
        match self {
            Error::Extract(e) => e.backoff_multiplier(),
            _ => 1,
        }
    }
}

impl IsRetryable for TransferError {
    fn is_retryable(&self) -> bool {
        match self {
            TransferError::HttpStatus { .. } => true,
            // 416 restarts from zero inside the attempt instead of backing off
            TransferError::RangeNotSatisfiable { .. } => false,
            TransferError::ExhaustedRetries { .. } => false,
            TransferError::Finalize { .. } => false,
        }
    }
}

impl IsRetryable for ExtractError {
    fn is_retryable(&self) -> bool {
        match self {
            ExtractError::HttpStatus { .. } => true,
            ExtractError::RateLimited { .. } => true,
            ExtractError::Malformed { .. } => false,
        }
    }

    fn backoff_multiplier(&self) -> u32 {
        match self {
            ExtractError::RateLimited { .. } => 4,
            _ => 1,
        }
    }
}

fn is_transient_network(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
}

fn is_transient_io(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::WouldBlock
    )
}

/// Execute an async operation with exponential backoff retry logic
///
/// `config.max_attempts` is the total number of attempts, including the first one.
///
/// # Returns
///
/// Returns the successful result, the first non-retryable error, or the last error
/// after all attempts are exhausted.
pub async fn download_with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let delay = backoff_delay(config, attempt)
                    .saturating_mul(e.backoff_multiplier())
                    .min(config.max_delay);

                tracing::warn!(
                    error = %e,
                    attempt = attempt + 1,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Delay to wait after the failed attempt with zero-based index `attempt`
///
/// Never exceeds `max_delay` before jitter, whatever the factor.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let growth = match config.backoff {
        Backoff::Exponential => 2f64.powi(attempt.min(30) as i32),
        Backoff::Linear => f64::from(attempt) + 1.0,
    };
    let cap = config.max_delay.as_secs_f64();
    let secs = (config.backoff_factor.as_secs_f64() * growth).min(cap);
    let delay = Duration::try_from_secs_f64(secs).unwrap_or(config.max_delay);
    if config.jitter {
        add_jitter(delay)
    } else {
        delay
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor)).unwrap_or(delay)
}
