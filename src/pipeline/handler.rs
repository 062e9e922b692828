//! Per-record work done by pipeline workers.

use crate::config::DownloadConfig;
use crate::downloader::{BatchOrchestrator, BatchResult, tasks_for_record};
use crate::types::Record;
use crate::utils::{POSTS_DIR, profile_dir};
use tokio_util::sync::CancellationToken;

/// Work performed for each record popped from the pipeline queue
#[async_trait::async_trait]
pub trait RecordHandler: Send + Sync {
    /// Process one record; per-file failures are reported in the result, never raised
    async fn handle(&self, record: Record, cancel: &CancellationToken) -> BatchResult;
}

/// Downloads a record's files into `<download_dir>/<service>/<user>/posts/<folder>/`
#[derive(Clone, Debug)]
pub struct RecordDownloader {
    orchestrator: BatchOrchestrator,
    config: DownloadConfig,
}

impl RecordDownloader {
    /// Create a handler delegating to `orchestrator`
    pub fn new(orchestrator: BatchOrchestrator, config: &DownloadConfig) -> Self {
        Self {
            orchestrator,
            config: config.clone(),
        }
    }

    /// Download one record, then wait the inter-post delay unless cancelled
    pub async fn download(&self, record: &Record, cancel: &CancellationToken) -> BatchResult {
        let posts_dir =
            profile_dir(&self.config.download_dir, &record.service, &record.user).join(POSTS_DIR);
        let tasks = tasks_for_record(record, &posts_dir, &self.config);
        if tasks.is_empty() {
            tracing::debug!(post_id = %record.id, "Post has no files");
            return BatchResult::default();
        }

        let result = self.orchestrator.run(tasks, cancel).await;
        tracing::info!(
            post_id = %record.id,
            downloaded = result.downloaded,
            skipped = result.skipped,
            failed = result.failed.len(),
            "Post processed"
        );

        if !self.config.post_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.post_delay) => {}
            }
        }
        result
    }
}

#[async_trait::async_trait]
impl RecordHandler for RecordDownloader {
    async fn handle(&self, record: Record, cancel: &CancellationToken) -> BatchResult {
        self.download(&record, cancel).await
    }
}
