//! Batch orchestration: gate every candidate, then fan transfers out over a bounded pool.

use super::gate::{GateDecision, VerificationGate};
use super::transfer::TransferEngine;
use super::DownloadTask;
use crate::config::Config;
use crate::ledger::FailureLedger;
use crate::session::Session;
use crate::types::{Event, TransferOutcome};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A file that could not be completed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedFile {
    /// Source URL
    pub url: String,
    /// Destination path
    pub path: PathBuf,
    /// Last error
    pub error: String,
}

/// Aggregate outcome of one batch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Files handed to the batch
    pub total: usize,
    /// Files transferred
    pub downloaded: usize,
    /// Files whose local content was trusted
    pub skipped: usize,
    /// Files that could not be completed
    pub failed: Vec<FailedFile>,
    /// Files never started because the run was cancelled
    pub cancelled: usize,
}

impl BatchResult {
    /// Completed files, including skipped ones
    pub fn success_count(&self) -> usize {
        self.downloaded + self.skipped
    }

    /// Whether every file completed
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.cancelled == 0
    }
}

/// Runs the verification gate and the transfer engine over a set of files
///
/// Per-file failures are isolated: they are collected in [`BatchResult::failed`]
/// (and recorded in the failure ledger, if one is attached) and never stop sibling
/// transfers.
#[derive(Clone, Debug)]
pub struct BatchOrchestrator {
    gate: VerificationGate,
    engine: TransferEngine,
    ledger: Option<Arc<FailureLedger>>,
    events: Option<tokio::sync::broadcast::Sender<Event>>,
    verify_workers: usize,
    download_workers: usize,
    skip_existing: bool,
}

impl BatchOrchestrator {
    /// Create an orchestrator from the download settings of `config`
    pub fn new(session: Session, config: &Config) -> Self {
        Self {
            gate: VerificationGate::new(session.clone(), &config.download),
            engine: TransferEngine::new(session, config),
            ledger: None,
            events: None,
            verify_workers: config.download.verify_workers.max(1),
            download_workers: config.download.download_workers.max(1),
            skip_existing: config.download.skip_existing,
        }
    }

    /// Record failed URLs in `ledger` and clear completed ones from it
    pub fn with_ledger(mut self, ledger: Arc<FailureLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Emit per-file events on this channel
    pub fn with_events(mut self, events: tokio::sync::broadcast::Sender<Event>) -> Self {
        self.engine = self.engine.with_events(events.clone());
        self.events = Some(events);
        self
    }

    /// Use a different download pool size
    pub fn with_download_workers(mut self, workers: usize) -> Self {
        self.download_workers = workers.max(1);
        self
    }

    /// The transfer engine used for downloads
    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    /// Download `tasks`, returning partial results if `cancel` fires
    ///
    /// Cancellation stops tasks that have not started yet; transfers already in
    /// flight run to completion or failure.
    pub async fn run(&self, tasks: Vec<DownloadTask>, cancel: &CancellationToken) -> BatchResult {
        let mut result = BatchResult {
            total: tasks.len(),
            ..BatchResult::default()
        };
        if tasks.is_empty() {
            return result;
        }

        let mut to_verify = Vec::new();
        let mut to_download = Vec::new();
        if self.skip_existing {
            for task in tasks {
                match self.gate.classify(&task.path).await {
                    GateDecision::Skip => self.record_skip(&task, &mut result),
                    GateDecision::NeedsVerify => to_verify.push(task),
                    GateDecision::NeedsDownload => to_download.push(task),
                }
            }
        } else {
            to_download = tasks;
        }

        if !to_verify.is_empty() {
            tracing::debug!(files = to_verify.len(), "Verifying existing files");
            let verified: Vec<(DownloadTask, Option<GateDecision>)> =
                futures::stream::iter(to_verify)
                    .map(|task| async move {
                        if cancel.is_cancelled() {
                            return (task, None);
                        }
                        let decision = self.gate.verify(&task.url, &task.path).await;
                        (task, Some(decision))
                    })
                    .buffer_unordered(self.verify_workers)
                    .collect()
                    .await;

            for (task, decision) in verified {
                match decision {
                    Some(GateDecision::Skip) => self.record_skip(&task, &mut result),
                    Some(_) => to_download.push(task),
                    None => result.cancelled += 1,
                }
            }
        }

        if !to_download.is_empty() {
            tracing::debug!(files = to_download.len(), "Downloading files");
            let outcomes: Vec<(DownloadTask, Option<crate::error::Result<TransferOutcome>>)> =
                futures::stream::iter(to_download)
                    .map(|task| async move {
                        if cancel.is_cancelled() {
                            return (task, None);
                        }
                        let outcome = self.engine.transfer(&task.url, &task.path).await;
                        (task, Some(outcome))
                    })
                    .buffer_unordered(self.download_workers)
                    .collect()
                    .await;

            for (task, outcome) in outcomes {
                match outcome {
                    Some(Ok(TransferOutcome::Skipped)) => {
                        self.record_skip(&task, &mut result);
                        self.clear_failure(&task.url).await;
                    }
                    Some(Ok(_)) => {
                        result.downloaded += 1;
                        self.emit(Event::FileDownloaded {
                            url: task.url.clone(),
                            path: task.path.clone(),
                        });
                        self.clear_failure(&task.url).await;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(url = %task.url, path = %task.path.display(), error = %e, "File failed");
                        self.emit(Event::FileFailed {
                            url: task.url.clone(),
                            error: e.to_string(),
                        });
                        self.record_failure(&task.url).await;
                        result.failed.push(FailedFile {
                            url: task.url,
                            path: task.path,
                            error: e.to_string(),
                        });
                    }
                    None => result.cancelled += 1,
                }
            }
        }

        if result.cancelled > 0 {
            tracing::warn!(
                cancelled = result.cancelled,
                completed = result.success_count(),
                "Batch interrupted, returning partial results"
            );
        }
        result
    }

    fn record_skip(&self, task: &DownloadTask, result: &mut BatchResult) {
        tracing::debug!(path = %task.path.display(), "Skipping existing file");
        result.skipped += 1;
        self.emit(Event::FileSkipped {
            url: task.url.clone(),
            path: task.path.clone(),
        });
    }

    async fn record_failure(&self, url: &str) {
        if let Some(ledger) = &self.ledger
            && let Err(e) = ledger.add(url).await
        {
            tracing::error!(url = %url, error = %e, "Failed to update failure ledger");
        }
    }

    async fn clear_failure(&self, url: &str) {
        if let Some(ledger) = &self.ledger
            && let Err(e) = ledger.remove(url).await
        {
            tracing::error!(url = %url, error = %e, "Failed to update failure ledger");
        }
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.send(event).ok();
        }
    }
}
