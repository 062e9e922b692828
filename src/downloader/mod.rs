//! File download machinery split into focused submodules.
//!
//! - [`gate`] - local-first decision whether existing content can be trusted
//! - [`transfer`] - resumable single-file transfer with retry and atomic finalize
//! - [`batch`] - per-record orchestration over bounded verify/download pools

mod batch;
mod gate;
mod transfer;

pub use batch::{BatchOrchestrator, BatchResult, FailedFile};
pub use gate::{GateDecision, VerificationGate};
pub use transfer::TransferEngine;

use crate::config::DownloadConfig;
use crate::types::{FileRef, Record};
use crate::utils::{file_name_for, post_folder_name};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// One file to fetch: source URL and final destination
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadTask {
    /// Source URL
    pub url: String,
    /// Final destination path (the partial lives next to it)
    pub path: PathBuf,
}

/// Destinations for `files` inside `dir`
///
/// Files are numbered from 1 in publication order. Repeated URLs, and names that
/// would collide on disk, are dropped keeping the first occurrence.
pub fn tasks_for_files(files: &[FileRef], dir: &Path) -> Vec<DownloadTask> {
    let mut seen_urls = HashSet::new();
    let mut seen_names = HashSet::new();
    files
        .iter()
        .enumerate()
        .filter_map(|(i, file)| {
            if !seen_urls.insert(file.url.as_str()) {
                return None;
            }
            let name = file_name_for(i + 1, &file.name, &file.url);
            if !seen_names.insert(name.clone()) {
                return None;
            }
            Some(DownloadTask {
                url: file.url.clone(),
                path: dir.join(name),
            })
        })
        .collect()
}

/// Destinations for a record's files under `posts_dir/<post folder>/`
pub fn tasks_for_record(
    record: &Record,
    posts_dir: &Path,
    config: &DownloadConfig,
) -> Vec<DownloadTask> {
    let folder = posts_dir.join(post_folder_name(record, config.post_folder_name));
    tasks_for_files(&record.files, &folder)
}
