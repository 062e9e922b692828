//! Failure ledger: the persisted set of URLs whose last transfer did not complete
//!
//! The ledger is a newline-delimited text file holding the whole set, sorted. Every
//! mutation loads the set, changes it, and rewrites the file through a temporary
//! file and a rename. A single async mutex serializes those read-modify-write
//! cycles, so concurrent download workers never lose each other's updates. Share one
//! [`FailureLedger`] per file; separate processes writing the same file are not
//! coordinated.

use crate::downloader::TransferEngine;
use crate::error::Result;
use crate::utils::sanitize_filename;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Persisted set of failed URLs or links
#[derive(Debug)]
pub struct FailureLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

/// Summary of a [`FailureLedger::retry_all`] run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// Entries attempted
    pub attempted: usize,
    /// Entries that completed and were removed from the ledger
    pub succeeded: usize,
    /// Entries still failing, left in the ledger
    pub still_failed: Vec<String>,
}

impl FailureLedger {
    /// Ledger backed by the file at `path` (created on first write)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents
    pub async fn load(&self) -> Result<BTreeSet<String>> {
        let _guard = self.lock.lock().await;
        read_set(&self.path).await
    }

    /// Whether `url` is recorded as failed
    pub async fn contains(&self, url: &str) -> Result<bool> {
        Ok(self.load().await?.contains(url.trim()))
    }

    /// Record `url` as failed; returns false if it was already present
    pub async fn add(&self, url: &str) -> Result<bool> {
        let url = url.trim();
        if url.is_empty() {
            return Ok(false);
        }
        let _guard = self.lock.lock().await;
        let mut set = read_set(&self.path).await?;
        if !set.insert(url.to_string()) {
            return Ok(false);
        }
        write_set(&self.path, &set).await?;
        tracing::debug!(url = %url, ledger = %self.path.display(), "Recorded failure");
        Ok(true)
    }

    /// Forget `url`; returns false if it was not present
    pub async fn remove(&self, url: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut set = read_set(&self.path).await?;
        if !set.remove(url.trim()) {
            return Ok(false);
        }
        write_set(&self.path, &set).await?;
        tracing::debug!(url = %url, ledger = %self.path.display(), "Cleared failure");
        Ok(true)
    }

    /// Retry every recorded URL into `dir`, removing each one that completes
    ///
    /// The destination name is the last URL path segment. Entries are retried one at
    /// a time; the lock is only held while the file is read or rewritten.
    pub async fn retry_all(&self, engine: &TransferEngine, dir: &Path) -> Result<RetryReport> {
        self.retry_where(engine, dir, |_| true).await
    }

    /// Like [`retry_all`](Self::retry_all), restricted to entries accepted by `filter`
    pub async fn retry_where<F>(
        &self,
        engine: &TransferEngine,
        dir: &Path,
        filter: F,
    ) -> Result<RetryReport>
    where
        F: Fn(&str) -> bool,
    {
        let entries: Vec<String> = self
            .load()
            .await?
            .into_iter()
            .filter(|entry| filter(entry))
            .collect();
        let mut report = RetryReport::default();
        if entries.is_empty() {
            tracing::info!(ledger = %self.path.display(), "No failed downloads to retry");
            return Ok(report);
        }

        tokio::fs::create_dir_all(dir).await?;
        for url in entries {
            report.attempted += 1;
            let dest = dir.join(file_name_from_url(&url));
            match engine.transfer(&url, &dest).await {
                Ok(_) => {
                    tracing::info!(url = %url, "Retried and downloaded");
                    self.remove(&url).await?;
                    report.succeeded += 1;
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Retry failed");
                    report.still_failed.push(url);
                }
            }
        }
        Ok(report)
    }
}

/// Destination name for a retried URL: its decoded, sanitized last path segment
fn file_name_from_url(url: &str) -> String {
    let segment = url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .unwrap_or_default();
    let decoded = urlencoding::decode(&segment)
        .map(|s| s.into_owned())
        .unwrap_or(segment);
    let name = sanitize_filename(&decoded);
    if name.is_empty() {
        "download".to_string()
    } else {
        name
    }
}

async fn read_set(path: &Path) -> Result<BTreeSet<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_set(path: &Path, set: &BTreeSet<String>) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut content = String::new();
    for entry in set {
        content.push_str(entry);
        content.push('\n');
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
