//! Configuration types for post-dl
//!
//! The configuration is immutable for the duration of an operation and shared as
//! `Arc<Config>`. Loading and saving the file that backs it is left to the caller;
//! every field has a serde default so a partial JSON document is enough.

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// File download behavior (destinations, worker pools, verification, timeouts)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Root directory for downloaded profiles (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Concurrent file transfers per record (default: 5)
    #[serde(default = "default_download_workers")]
    pub download_workers: usize,

    /// Concurrent remote size checks per record (default: 10)
    #[serde(default = "default_verify_workers")]
    pub verify_workers: usize,

    /// Always confirm existing files against the remote size (default: false)
    #[serde(default)]
    pub strict_verification: bool,

    /// Run the verification gate at all; when false every file is transferred (default: true)
    #[serde(default = "default_true")]
    pub skip_existing: bool,

    /// Read buffer size hint for streamed bodies, in bytes (default: 8192)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Timeout for HEAD size probes (default: 5 seconds)
    #[serde(default = "default_head_timeout", with = "duration_serde")]
    pub head_timeout: Duration,

    /// Timeout for GET transfers (default: 30 seconds)
    #[serde(default = "default_get_timeout", with = "duration_serde")]
    pub get_timeout: Duration,

    /// Pause between records handled by the same worker (default: 0.5 seconds)
    #[serde(default = "default_post_delay", with = "duration_serde")]
    pub post_delay: Duration,

    /// How each record's folder is named (default: id)
    #[serde(default)]
    pub post_folder_name: PostFolderName,

    /// Process archived records oldest first (default: false, newest first)
    #[serde(default)]
    pub process_from_oldest: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            download_workers: default_download_workers(),
            verify_workers: default_verify_workers(),
            strict_verification: false,
            skip_existing: true,
            chunk_size: default_chunk_size(),
            head_timeout: default_head_timeout(),
            get_timeout: default_get_timeout(),
            post_delay: default_post_delay(),
            post_folder_name: PostFolderName::default(),
            process_from_oldest: false,
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per file, including the first one (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay; see [`Backoff`] for how it grows (default: 1 second)
    #[serde(default = "default_backoff_factor", with = "duration_serde")]
    pub backoff_factor: Duration,

    /// How the delay grows between attempts (default: exponential)
    #[serde(default)]
    pub backoff: Backoff,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_factor: default_backoff_factor(),
            backoff: Backoff::default(),
            max_delay: default_max_delay(),
            jitter: false,
        }
    }
}

/// Growth of the delay after the failed attempt with zero-based index `n`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// `backoff_factor * 2^n`
    #[default]
    Exponential,
    /// `backoff_factor * (n + 1)`
    Linear,
}

/// Listing/detail crawl settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Items per listing page (default: 50)
    #[serde(default = "default_page_size")]
    pub page_size: u64,

    /// Bare fetch-mode values with at most this many digits are offsets, longer ones are IDs (default: 5)
    #[serde(default = "default_offset_digit_limit")]
    pub offset_digit_limit: usize,

    /// Keep records that reference no files (default: false)
    #[serde(default)]
    pub save_empty_posts: bool,

    /// Pause between listing pages (default: 0)
    #[serde(default, with = "duration_serde")]
    pub page_delay: Duration,

    /// Timeout for API calls (default: 30 seconds)
    #[serde(default = "default_get_timeout", with = "duration_serde")]
    pub api_timeout: Duration,

    /// Directory for cached detail payloads; `None` disables the cache (default: "./temp_json")
    #[serde(default = "default_detail_cache_dir")]
    pub detail_cache_dir: Option<PathBuf>,

    /// Accounts requested per favorites page (default: 50)
    #[serde(default = "default_favorites_page_size")]
    pub favorites_page_size: usize,

    /// Stop after this many favorite accounts (default: no limit)
    #[serde(default)]
    pub favorites_limit: Option<usize>,

    /// Pause between favorites pages (default: 0.5 seconds)
    #[serde(default = "default_post_delay", with = "duration_serde")]
    pub favorites_delay: Duration,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            offset_digit_limit: default_offset_digit_limit(),
            save_empty_posts: false,
            page_delay: Duration::ZERO,
            api_timeout: default_get_timeout(),
            detail_cache_dir: default_detail_cache_dir(),
            favorites_page_size: default_favorites_page_size(),
            favorites_limit: None,
            favorites_delay: default_post_delay(),
        }
    }
}

/// Extraction/download overlap settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Records buffered between the producer and download workers (default: 10)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Download workers draining the queue (default: 3)
    #[serde(default = "default_pipeline_workers")]
    pub pipeline_workers: usize,

    /// How long a blocked push waits before logging and retrying (default: 10 seconds)
    #[serde(default = "default_push_timeout", with = "duration_serde")]
    pub push_timeout: Duration,

    /// How long an idle worker waits on the queue before re-checking for shutdown (default: 1 second)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// Interval of the progress reporter (default: 0.5 seconds)
    #[serde(default = "default_progress_interval", with = "duration_serde")]
    pub progress_interval: Duration,

    /// Profile or post links processed concurrently (default: 3)
    #[serde(default = "default_profile_workers")]
    pub profile_workers: usize,

    /// Extraction workers in two-phase mode (default: 3)
    #[serde(default = "default_two_phase_extract_workers")]
    pub two_phase_extract_workers: usize,

    /// Download workers in two-phase mode (default: 2)
    #[serde(default = "default_two_phase_download_workers")]
    pub two_phase_download_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            pipeline_workers: default_pipeline_workers(),
            push_timeout: default_push_timeout(),
            poll_interval: default_poll_interval(),
            progress_interval: default_progress_interval(),
            profile_workers: default_profile_workers(),
            two_phase_extract_workers: default_two_phase_extract_workers(),
            two_phase_download_workers: default_two_phase_download_workers(),
        }
    }
}

/// Main configuration for post-dl
///
/// Sub-configs are flattened so the serialized form is a single flat object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// File download behavior
    #[serde(flatten)]
    pub download: DownloadConfig,

    /// Retry policy for file transfers
    #[serde(flatten)]
    pub retry: RetryConfig,

    /// Listing/detail crawl settings
    #[serde(flatten)]
    pub extraction: ExtractionConfig,

    /// Producer/consumer pipeline settings
    #[serde(flatten)]
    pub pipeline: PipelineConfig,

    /// Failure ledger file (default: "failed_downloads.txt")
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download: DownloadConfig::default(),
            retry: RetryConfig::default(),
            extraction: ExtractionConfig::default(),
            pipeline: PipelineConfig::default(),
            ledger_path: default_ledger_path(),
        }
    }
}

impl Config {
    /// Reject settings that would stall or break a run
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::Error;

        let positive = [
            ("download_workers", self.download.download_workers),
            ("verify_workers", self.download.verify_workers),
            ("chunk_size", self.download.chunk_size),
            ("queue_capacity", self.pipeline.queue_capacity),
            ("pipeline_workers", self.pipeline.pipeline_workers),
            ("profile_workers", self.pipeline.profile_workers),
            (
                "two_phase_extract_workers",
                self.pipeline.two_phase_extract_workers,
            ),
            (
                "two_phase_download_workers",
                self.pipeline.two_phase_download_workers,
            ),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(Error::config(key, format!("{key} must be greater than zero")));
            }
        }
        if self.extraction.favorites_page_size == 0 {
            return Err(Error::config(
                "favorites_page_size",
                "favorites_page_size must be greater than zero",
            ));
        }
        if self.extraction.page_size == 0 {
            return Err(Error::config("page_size", "page_size must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("max_attempts", "max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Folder naming for a record's files
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostFolderName {
    /// `<id>`
    #[default]
    Id,
    /// `<id>_<sanitized title>`, falling back to `<id>` for untitled records
    Title,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_download_workers() -> usize {
    5
}

fn default_verify_workers() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    8192
}

fn default_head_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_get_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_post_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_factor() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_page_size() -> u64 {
    50
}

fn default_offset_digit_limit() -> usize {
    5
}

fn default_favorites_page_size() -> usize {
    50
}

fn default_detail_cache_dir() -> Option<PathBuf> {
    Some(PathBuf::from("./temp_json"))
}

fn default_queue_capacity() -> usize {
    10
}

fn default_pipeline_workers() -> usize {
    3
}

fn default_push_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_profile_workers() -> usize {
    3
}

fn default_two_phase_extract_workers() -> usize {
    3
}

fn default_two_phase_download_workers() -> usize {
    2
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("failed_downloads.txt")
}

/// Durations as (fractional) seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
