//! Core types for post-dl

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A file referenced by a record: display name plus source URL
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    /// Name as published by the source (may be empty)
    pub name: String,
    /// Absolute download URL
    pub url: String,
}

impl FileRef {
    /// Create a new file reference
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// One crawled item, immutable once emitted by the extractor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stable unique item ID
    pub id: String,
    /// Owning user ID
    pub user: String,
    /// Service the user publishes on
    pub service: String,
    /// Item title (may be empty)
    #[serde(default)]
    pub title: String,
    /// Public link to the item
    pub link: String,
    /// 1-based listing page the item came from
    pub page: u64,
    /// Listing offset of that page
    pub offset: u64,
    /// Referenced files in publication order, unique by URL
    #[serde(default)]
    pub files: Vec<FileRef>,
}

/// Result of handling one file
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Existing local content was trusted; nothing was transferred
    Skipped,
    /// The file was transferred (or resumed) and finalized
    Downloaded,
    /// The file could not be completed
    Failed(String),
}

/// Counters for one pipeline run
///
/// `extracted` counts records; the other three count files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Records produced by the extractor
    pub extracted: u64,
    /// Files transferred
    pub downloaded: u64,
    /// Files whose existing local copy was trusted
    pub skipped: u64,
    /// Files that could not be completed
    pub failed: u64,
}

impl PipelineStats {
    /// Add another run's counters to this one
    pub fn merge(&mut self, other: &PipelineStats) {
        self.extracted += other.extracted;
        self.downloaded += other.downloaded;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Extracted: {}, Downloaded: {}, Skipped: {}, Failed: {}",
            self.extracted, self.downloaded, self.skipped, self.failed
        )
    }
}

/// Events emitted while crawling and downloading
///
/// Delivered over a `tokio::sync::broadcast` channel; slow subscribers may miss events.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The extractor produced a record
    RecordExtracted {
        /// Record ID
        id: String,
        /// Number of files the record references
        files: usize,
    },

    /// Bytes were appended to a partial file
    TransferProgress {
        /// Source URL
        url: String,
        /// Bytes on disk so far, including resumed bytes
        downloaded: u64,
        /// Expected total, when the server reported one
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
    },

    /// Existing local content was trusted
    FileSkipped {
        /// Source URL
        url: String,
        /// Destination path
        path: PathBuf,
    },

    /// A file was transferred and finalized
    FileDownloaded {
        /// Source URL
        url: String,
        /// Destination path
        path: PathBuf,
    },

    /// A file could not be completed
    FileFailed {
        /// Source URL
        url: String,
        /// Last error
        error: String,
    },

    /// Periodic pipeline counters
    Progress(PipelineStats),

    /// The pipeline drained and stopped
    PipelineFinished(PipelineStats),
}
