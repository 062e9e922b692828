//! High-level entry point tying extraction, the pipeline, archives and the ledger together

use crate::archive::{PostArchive, archive_file_name, save_profile};
use crate::config::Config;
use crate::downloader::BatchOrchestrator;
use crate::error::{Error, Result};
use crate::extractor::{Extractor, FetchClient, HttpFetchClient, ProfileScan, SourceLink};
use crate::ledger::{FailureLedger, RetryReport};
use crate::pipeline::{Pipeline, RecordDownloader};
use crate::session::Session;
use crate::types::{Event, PipelineStats};
use crate::utils::{CleanupReport, cleanup_stale_partials, profile_dir};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Capacity of the event channel; slow subscribers miss older events
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Aggregate outcome of a run over several links
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultiRunReport {
    /// Counters summed over every link that ran
    pub stats: PipelineStats,
    /// Links that completed without a fatal error
    pub completed: Vec<String>,
    /// Links that failed fatally, with the error
    pub failed: Vec<(String, String)>,
}

impl MultiRunReport {
    fn record(&mut self, link: &str, outcome: Result<PipelineStats>) {
        match outcome {
            Ok(stats) => {
                self.stats.merge(&stats);
                self.completed.push(link.to_string());
            }
            Err(e) => {
                tracing::error!(link = %link, error = %e, "Link failed");
                self.failed.push((link.to_string(), e.to_string()));
            }
        }
    }
}

/// Crawls profiles and posts and downloads their files
///
/// Holds the immutable configuration, the session used for every request, the
/// failure ledger, the event channel, and the run's cancellation token. Clones
/// share all of them.
#[derive(Clone)]
pub struct Runner {
    config: Arc<Config>,
    session: Session,
    client: Arc<dyn FetchClient>,
    ledger: Arc<FailureLedger>,
    event_tx: broadcast::Sender<Event>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("ledger", &self.ledger.path())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Create a runner; fails if the configuration is invalid
    pub fn new(config: Config, session: Session) -> Result<Self> {
        config.validate()?;
        let client = Arc::new(HttpFetchClient::new(
            session.clone(),
            config.extraction.api_timeout,
        ));
        let ledger = Arc::new(FailureLedger::new(config.ledger_path.clone()));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config: Arc::new(config),
            session,
            client,
            ledger,
            event_tx,
            cancel: CancellationToken::new(),
        })
    }

    /// Use another listing/detail API client
    pub fn with_fetch_client(mut self, client: Arc<dyn FetchClient>) -> Self {
        self.client = client;
        self
    }

    /// Subscribe to crawl and download events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Token that interrupts every operation of this runner when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The failure ledger
    pub fn ledger(&self) -> &Arc<FailureLedger> {
        &self.ledger
    }

    /// The configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn extractor(&self) -> Extractor {
        Extractor::new(self.client.clone(), &self.config.extraction)
    }

    fn orchestrator(&self) -> BatchOrchestrator {
        BatchOrchestrator::new(self.session.clone(), &self.config)
            .with_ledger(self.ledger.clone())
            .with_events(self.event_tx.clone())
    }

    fn record_downloader(&self) -> RecordDownloader {
        RecordDownloader::new(self.orchestrator(), &self.config.download)
    }

    /// Crawl one profile and download its files with overlapping extraction
    ///
    /// `fetch_mode` is `"all"`, a page offset, an offset range, a post ID, or a post
    /// ID range. Only an unsupported link, an invalid fetch mode or an unreachable
    /// profile summary fail the run; everything else is counted.
    pub async fn run_profile(&self, link: &str, fetch_mode: &str) -> Result<PipelineStats> {
        let link = profile_link(link)?;
        let extractor = self.extractor();
        let scan = extractor.open(&link, fetch_mode).await?;
        self.save_profile_summary(&scan).await;

        let pipeline = Pipeline::new(&self.config.pipeline, Arc::new(self.record_downloader()))
            .with_events(self.event_tx.clone());
        Ok(pipeline.run(extractor.records(scan), &self.cancel).await)
    }

    /// Run [`run_profile`](Self::run_profile) for each link, `profile_workers` at a time
    pub async fn run_profiles(&self, links: &[String], fetch_mode: &str) -> MultiRunReport {
        let outcomes: Vec<(String, Result<PipelineStats>)> = futures::stream::iter(links)
            .map(|link| async move { (link.clone(), self.run_profile(link, fetch_mode).await) })
            .buffer_unordered(self.config.pipeline.profile_workers.max(1))
            .collect()
            .await;

        let mut report = MultiRunReport::default();
        for (link, outcome) in outcomes {
            report.record(&link, outcome);
        }
        tracing::info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            stats = %report.stats,
            "All profiles processed"
        );
        report
    }

    /// Crawl one profile without downloading, saving its records as an archive
    ///
    /// The archive is rewritten after every page that yields records, so an
    /// interrupted crawl keeps what it found. Returns the archive path,
    /// `<download_dir>/<service>/<user>/posts-<first>-<last>-<date>.json`.
    pub async fn collect_profile(&self, link: &str, fetch_mode: &str) -> Result<PathBuf> {
        let link = profile_link(link)?;
        let extractor = self.extractor();
        let scan = extractor.open(&link, fetch_mode).await?;
        let dir = self.save_profile_summary(&scan).await;
        let path = dir.join(archive_file_name(
            &scan.plan.offsets,
            chrono::Local::now().date_naive(),
        ));

        let mut archive = PostArchive::default();
        let mut pages = extractor.pages(scan);
        loop {
            let page = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!(link = %link, "Collection cancelled");
                    break;
                }
                page = pages.next() => page,
            };
            let Some(page) = page else {
                break;
            };
            for record in &page {
                self.emit(Event::RecordExtracted {
                    id: record.id.clone(),
                    files: record.files.len(),
                });
            }
            archive.extend(page);
            archive.save(&path).await?;
            tracing::debug!(path = %path.display(), posts = archive.total_posts, "Archive updated");
        }

        if archive.posts.is_empty() {
            archive.save(&path).await?;
        }
        tracing::info!(link = %link, path = %path.display(), posts = archive.total_posts, "Profile collected");
        Ok(path)
    }

    /// Write the profile summary into the profile folder; returns the folder
    async fn save_profile_summary(&self, scan: &ProfileScan) -> PathBuf {
        let dir = profile_dir(
            &self.config.download.download_dir,
            &scan.link.service,
            &scan.link.user,
        );
        if let Err(e) = save_profile(&dir, &scan.profile).await {
            tracing::warn!(link = %scan.link, error = %e, "Failed to save profile summary");
        }
        dir
    }

    /// Download the records of an archive, one post at a time
    ///
    /// With `post_id`, only that post is downloaded. Posts are taken newest first
    /// unless `process_from_oldest` is set; the inter-post delay applies between them.
    pub async fn download_archive(
        &self,
        path: &Path,
        post_id: Option<&str>,
    ) -> Result<PipelineStats> {
        let archive = PostArchive::load(path).await?;
        let posts = archive.select_posts(post_id, self.config.download.process_from_oldest);
        if posts.is_empty() {
            tracing::warn!(path = %path.display(), post_id = ?post_id, "No matching posts in archive");
            return Ok(PipelineStats::default());
        }
        tracing::info!(path = %path.display(), posts = posts.len(), "Downloading archive");

        let downloader = self.record_downloader();
        let mut stats = PipelineStats::default();
        for record in posts {
            if self.cancel.is_cancelled() {
                tracing::info!(path = %path.display(), "Archive download cancelled");
                break;
            }
            stats.extracted += 1;
            let result = downloader.download(&record, &self.cancel).await;
            stats.downloaded += result.downloaded as u64;
            stats.skipped += result.skipped as u64;
            stats.failed += result.failed.len() as u64;
        }
        tracing::info!(path = %path.display(), %stats, "Archive processed");
        Ok(stats)
    }

    /// Extract every link into an archive first, then download the archives
    ///
    /// Extraction runs `two_phase_extract_workers` links at a time, downloading
    /// `two_phase_download_workers` archives at a time.
    pub async fn run_two_phase(&self, links: &[String], fetch_mode: &str) -> MultiRunReport {
        let mut report = MultiRunReport::default();

        let collected: Vec<(String, Result<PathBuf>)> = futures::stream::iter(links)
            .map(|link| async move { (link.clone(), self.collect_profile(link, fetch_mode).await) })
            .buffer_unordered(self.config.pipeline.two_phase_extract_workers.max(1))
            .collect()
            .await;

        let mut archives = Vec::new();
        for (link, outcome) in collected {
            match outcome {
                Ok(path) => archives.push((link, path)),
                Err(e) => report.record(&link, Err(e)),
            }
        }
        tracing::info!(archives = archives.len(), "Extraction phase complete");

        let downloaded: Vec<(String, Result<PipelineStats>)> = futures::stream::iter(archives)
            .map(|(link, path)| async move {
                let outcome = self.download_archive(&path, None).await;
                (link, outcome)
            })
            .buffer_unordered(self.config.pipeline.two_phase_download_workers.max(1))
            .collect()
            .await;
        for (link, outcome) in downloaded {
            report.record(&link, outcome);
        }
        tracing::info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            stats = %report.stats,
            "Two-phase run complete"
        );
        report
    }

    /// Crawl every favorite account of the session on `site`, e.g. `https://host`
    ///
    /// Each account is crawled with fetch mode `"all"`: through the overlapping
    /// pipeline ([`run_profiles`](Self::run_profiles)), or with `two_phase` by
    /// extracting every account before downloading ([`run_two_phase`](Self::run_two_phase)).
    /// Only a failure to list the favorites fails the run.
    pub async fn run_favorites(&self, site: &str, two_phase: bool) -> Result<MultiRunReport> {
        let links: Vec<String> = self
            .extractor()
            .favorites(site)
            .await?
            .iter()
            .map(SourceLink::profile_link)
            .collect();
        tracing::info!(site = %site, accounts = links.len(), two_phase, "Processing favorites");

        let report = if two_phase {
            self.run_two_phase(&links, "all").await
        } else {
            self.run_profiles(&links, "all").await
        };
        Ok(report)
    }

    /// Download single posts by link, `profile_workers` at a time
    ///
    /// A link with any failed or unstarted file is recorded in the failure ledger;
    /// a link whose files all completed is removed from it.
    pub async fn download_post_links(&self, links: &[String]) -> MultiRunReport {
        let downloader = self.record_downloader();
        let extractor = self.extractor();

        let outcomes: Vec<(String, Result<PipelineStats>)> = futures::stream::iter(links)
            .map(|link| {
                let downloader = &downloader;
                let extractor = &extractor;
                async move {
                    let outcome = self.download_post_link(link, extractor, downloader).await;
                    (link.clone(), outcome)
                }
            })
            .buffer_unordered(self.config.pipeline.profile_workers.max(1))
            .collect()
            .await;

        let mut report = MultiRunReport::default();
        for (link, outcome) in outcomes {
            report.record(&link, outcome);
        }
        report
    }

    async fn download_post_link(
        &self,
        link: &str,
        extractor: &Extractor,
        downloader: &RecordDownloader,
    ) -> Result<PipelineStats> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let source = SourceLink::parse(link)?;
        let record = match extractor.fetch_post(&source).await {
            Ok(record) => record,
            Err(e) => {
                self.note_link(link, false).await;
                return Err(e);
            }
        };

        let result = downloader.download(&record, &self.cancel).await;
        self.note_link(link, result.is_complete()).await;
        Ok(PipelineStats {
            extracted: 1,
            downloaded: result.downloaded as u64,
            skipped: result.skipped as u64,
            failed: result.failed.len() as u64,
        })
    }

    async fn note_link(&self, link: &str, complete: bool) {
        let outcome = if complete {
            self.ledger.remove(link).await
        } else {
            self.ledger.add(link).await
        };
        if let Err(e) = outcome {
            tracing::warn!(link = %link, error = %e, "Failed to update failure ledger");
        }
    }

    /// Retry everything in the failure ledger
    ///
    /// Post links are downloaded again as posts; file URLs are transferred into
    /// `<download_dir>/retried/`.
    pub async fn retry_failed(&self) -> Result<RetryReport> {
        let entries = self.ledger.load().await?;
        let post_links: Vec<String> = entries
            .iter()
            .filter(|entry| is_post_link(entry))
            .cloned()
            .collect();

        let mut report = RetryReport::default();
        if !post_links.is_empty() {
            let posts = self.download_post_links(&post_links).await;
            report.attempted += post_links.len();
            let still_failed = self.ledger.load().await?;
            for link in post_links {
                if still_failed.contains(&link) {
                    report.still_failed.push(link);
                } else {
                    report.succeeded += 1;
                }
            }
            tracing::debug!(stats = %posts.stats, "Post links retried");
        }

        let engine = self.orchestrator().engine().clone();
        let dir = self.config.download.download_dir.join("retried");
        let files = self
            .ledger
            .retry_where(&engine, &dir, |entry| !is_post_link(entry))
            .await?;
        report.attempted += files.attempted;
        report.succeeded += files.succeeded;
        report.still_failed.extend(files.still_failed);

        tracing::info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            still_failed = report.still_failed.len(),
            "Retry complete"
        );
        Ok(report)
    }

    /// Delete partial files under the download directory older than `older_than`
    ///
    /// Only call this while no transfer is running.
    pub async fn cleanup_partials(&self, older_than: Duration) -> Result<CleanupReport> {
        let dir = self.config.download.download_dir.clone();
        tokio::task::spawn_blocking(move || cleanup_stale_partials(&dir, older_than))
            .await
            .map_err(|e| Error::Other(format!("cleanup task failed: {e}")))?
    }

    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

fn profile_link(link: &str) -> Result<SourceLink> {
    let parsed = SourceLink::parse(link)?;
    if parsed.post_id.is_some() {
        return Err(Error::UnsupportedSource(format!(
            "{link} is a post link, expected a profile link"
        )));
    }
    Ok(parsed)
}

fn is_post_link(entry: &str) -> bool {
    SourceLink::parse(entry).is_ok_and(|link| link.post_id.is_some())
}
