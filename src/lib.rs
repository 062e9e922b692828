//! # post-dl
//!
//! Library for crawling paginated creator profiles and downloading the files their
//! posts reference, with resumable transfers and overlapping extraction/download.
//!
//! ## Design Philosophy
//!
//! post-dl is designed to be:
//! - **Resumable** - Partial files survive retries and restarts; finished files are
//!   trusted without a network round trip
//! - **Bounded** - Every worker pool and queue has a fixed size, so a slow download
//!   side throttles extraction instead of buffering without limit
//! - **Library-first** - No CLI or UI; authentication and config files stay with the
//!   caller, which hands in a ready [`Session`]
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use post_dl::{Config, Runner, Session, cancel_on_signal};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::new()?.with_cookie("example.su", "session=abc");
//!     let runner = Runner::new(Config::default(), session)?;
//!
//!     // Subscribe to events
//!     let mut events = runner.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     // Ctrl+C stops new work and lets running transfers finish
//!     tokio::spawn(cancel_on_signal(runner.cancel_token()));
//!
//!     let stats = runner
//!         .run_profile("https://example.su/fanbox/user/123", "all")
//!         .await?;
//!     println!("{stats}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Post archives for extract-only runs
pub mod archive;
/// Configuration types
pub mod config;
/// Verification gate, resumable transfers and batch orchestration
pub mod downloader;
/// Error types
pub mod error;
/// Listing/detail API client and the record producer
pub mod extractor;
/// Persisted set of failed downloads
pub mod ledger;
/// Producer/consumer pipeline
pub mod pipeline;
/// Fetch-mode parsing and offset planning
pub mod planner;
/// Retry logic with exponential backoff
pub mod retry;
/// High-level entry point
pub mod runner;
/// Request capability carrying headers and cookies
pub mod session;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use archive::PostArchive;
pub use config::{
    Backoff, Config, DownloadConfig, ExtractionConfig, PipelineConfig, PostFolderName, RetryConfig,
};
pub use downloader::{BatchOrchestrator, BatchResult, GateDecision, TransferEngine};
pub use error::{Error, ExtractError, Result, TransferError};
pub use extractor::{Extractor, FavoriteAccount, FetchClient, HttpFetchClient, SourceLink};
pub use ledger::{FailureLedger, RetryReport};
pub use pipeline::{Pipeline, PipelinePhase, RecordDownloader, RecordHandler};
pub use planner::{IdFilter, OffsetPlan, OffsetPlanner};
pub use runner::{MultiRunReport, Runner};
pub use session::Session;
pub use types::{Event, FileRef, PipelineStats, Record, TransferOutcome};

/// Cancel `token` when the process receives a termination signal.
///
/// Pipelines and batches watching the token stop starting new work and return
/// partial results; transfers already running finish or fail on their own.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use post_dl::{Config, Runner, Session, cancel_on_signal};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let runner = Runner::new(Config::default(), Session::new()?)?;
///     tokio::spawn(cancel_on_signal(runner.cancel_token()));
///     runner.retry_failed().await?;
///     Ok(())
/// }
/// ```
pub async fn cancel_on_signal(token: tokio_util::sync::CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = wait_for_signal() => {
            tracing::info!("Interrupt received, cancelling run");
            token.cancel();
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
