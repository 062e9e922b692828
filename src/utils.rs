//! Utility functions for file naming and on-disk housekeeping

use crate::config::PostFolderName;
use crate::error::Result;
use crate::types::Record;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

/// Suffix marking an in-progress transfer
pub const PARTIAL_SUFFIX: &str = ".part";

/// Folder under a profile directory holding one folder per record
pub const POSTS_DIR: &str = "posts";

/// Longest sanitized file stem, in characters
const MAX_STEM_CHARS: usize = 150;

/// Longest sanitized title used in folder names, in characters
const MAX_TITLE_CHARS: usize = 80;

// Static patterns; compilation cannot fail at runtime
#[allow(clippy::expect_used)]
static ILLEGAL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1F]"#).expect("valid pattern"));

#[allow(clippy::expect_used)]
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid pattern"));

/// Path of the partial artifact for `path` (`<path>.part`)
///
/// # Examples
///
/// ```
/// use post_dl::utils::partial_path;
/// use std::path::Path;
///
/// assert_eq!(
///     partial_path(Path::new("/tmp/1-photo.jpg")),
///     Path::new("/tmp/1-photo.jpg.part")
/// );
/// ```
pub fn partial_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(PARTIAL_SUFFIX);
    PathBuf::from(os)
}

/// Strip characters that are illegal on common filesystems
///
/// Collapses runs of whitespace, trims leading/trailing dots and spaces, and caps
/// the result at `max_chars` characters.
pub fn sanitize_component(name: &str, max_chars: usize) -> String {
    let cleaned = ILLEGAL_CHARS.replace_all(name, "");
    let collapsed = WHITESPACE.replace_all(&cleaned, " ");
    let trimmed = collapsed.trim_matches(|c: char| c == '.' || c == ' ');
    let capped: String = trimmed.chars().take(max_chars).collect();
    capped.trim_end_matches(|c: char| c == '.' || c == ' ').to_string()
}

/// Sanitize a file stem
pub fn sanitize_filename(name: &str) -> String {
    sanitize_component(name, MAX_STEM_CHARS)
}

/// Sanitize a record title for use in a folder name
pub fn sanitize_title(title: &str) -> String {
    sanitize_component(title, MAX_TITLE_CHARS)
}

/// Extension (with leading dot, lowercase) of the display name, else of the URL
/// path, else `.bin`; `.jpeg` is normalized to `.jpg`
pub fn file_extension(name: &str, url: &str) -> String {
    let from_name = extension_of(name.trim());
    let ext = from_name
        .or_else(|| {
            url::Url::parse(url).ok().and_then(|parsed| {
                let segment = parsed.path_segments()?.next_back()?.to_string();
                let decoded = urlencoding::decode(&segment)
                    .map(|s| s.into_owned())
                    .unwrap_or(segment);
                extension_of(&decoded)
            })
        })
        .unwrap_or_else(|| "bin".to_string());

    if ext == "jpeg" {
        ".jpg".to_string()
    } else {
        format!(".{ext}")
    }
}

fn extension_of(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?;
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Destination file name `<index>-<sanitized stem><ext>` for the file at 1-based `index`
///
/// An empty display name uses the index as the stem.
pub fn file_name_for(index: usize, name: &str, url: &str) -> String {
    let ext = file_extension(name, url);
    let trimmed = name.trim();
    let stem = if trimmed.is_empty() {
        String::new()
    } else {
        let path = Path::new(trimmed);
        let stem = match extension_of(trimmed) {
            Some(_) => path.file_stem().and_then(|s| s.to_str()).unwrap_or(trimmed),
            None => trimmed,
        };
        sanitize_filename(stem)
    };

    if stem.is_empty() {
        format!("{index}-{index}{ext}")
    } else {
        format!("{index}-{stem}{ext}")
    }
}

/// Folder holding a record's files
pub fn post_folder_name(record: &Record, mode: PostFolderName) -> String {
    let id = sanitize_filename(&record.id);
    match mode {
        PostFolderName::Id => id,
        PostFolderName::Title => {
            let title = sanitize_title(&record.title);
            if title.is_empty() {
                id
            } else {
                format!("{id}_{title}")
            }
        }
    }
}

/// Folder for a profile's downloads: `<service>/<user>`
pub fn profile_dir(download_dir: &Path, service: &str, user: &str) -> PathBuf {
    download_dir
        .join(sanitize_filename(service))
        .join(sanitize_filename(user))
}

/// Summary of a stale partial cleanup
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Partial files examined
    pub scanned: usize,
    /// Partial files deleted
    pub deleted: usize,
    /// Partial files kept because they were recent or could not be removed
    pub skipped: usize,
}

/// Recursively delete `.part` files under `dir` not modified for at least `older_than`
///
/// Only run this when no transfer is active under `dir`; a partial is the only
/// record of resumable progress.
pub fn cleanup_stale_partials(dir: &Path, older_than: Duration) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    if !dir.exists() {
        return Ok(report);
    }

    let now = SystemTime::now();
    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable entry during cleanup");
                continue;
            }
        };
        if !entry.file_type().is_file()
            || !entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX)
        {
            continue;
        }

        report.scanned += 1;
        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or(Duration::ZERO);

        if age < older_than {
            report.skipped += 1;
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                tracing::debug!(path = %entry.path().display(), "Deleted stale partial");
                report.deleted += 1;
            }
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "Failed to delete stale partial");
                report.skipped += 1;
            }
        }
    }

    tracing::info!(
        dir = %dir.display(),
        scanned = report.scanned,
        deleted = report.deleted,
        "Stale partial cleanup finished"
    );
    Ok(report)
}
