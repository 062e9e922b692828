//! Post archives: the records of one profile crawl saved as a JSON document
//!
//! Extract-only runs write an archive next to the profile's downloads; a later run
//! can download from it without touching the listing API again.

use crate::error::Result;
use crate::extractor::ProfileSummary;
use crate::types::Record;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// Records collected from one profile
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostArchive {
    /// Number of records in `posts`
    pub total_posts: usize,
    /// Records in crawl order
    pub posts: Vec<Record>,
}

impl PostArchive {
    /// Append one page of records
    pub fn extend(&mut self, records: impl IntoIterator<Item = Record>) {
        self.posts.extend(records);
        self.total_posts = self.posts.len();
    }

    /// Read an archive from disk
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let mut archive: PostArchive = serde_json::from_slice(&bytes)?;
        archive.total_posts = archive.posts.len();
        Ok(archive)
    }

    /// Write the archive as pretty JSON, replacing any previous version atomically
    pub async fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self).await
    }

    /// Records to download, optionally restricted to one post ID
    ///
    /// Records are ordered by ID, newest (highest) first unless `oldest_first`.
    /// Numeric IDs compare numerically.
    pub fn select_posts(&self, post_id: Option<&str>, oldest_first: bool) -> Vec<Record> {
        let mut posts: Vec<Record> = self
            .posts
            .iter()
            .filter(|record| post_id.is_none_or(|id| record.id == id))
            .cloned()
            .collect();
        posts.sort_by(|a, b| compare_ids(&a.id, &b.id));
        if !oldest_first {
            posts.reverse();
        }
        posts
    }
}

fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Archive file name for a crawl of `offsets` on `date`
///
/// # Examples
///
/// ```
/// use chrono::NaiveDate;
/// use post_dl::archive::archive_file_name;
///
/// let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
/// assert_eq!(archive_file_name(&[0, 50, 100], date), "posts-0-100-2024-05-01.json");
/// assert_eq!(archive_file_name(&[50], date), "posts-50-2024-05-01.json");
/// ```
pub fn archive_file_name(offsets: &[u64], date: NaiveDate) -> String {
    let date = date.format("%Y-%m-%d");
    match offsets {
        [] => format!("posts-0-0-{date}.json"),
        [only] => format!("posts-{only}-{date}.json"),
        [first, .., last] => format!("posts-{first}-{last}-{date}.json"),
    }
}

/// File holding the profile summary inside a profile folder
pub const PROFILE_FILE: &str = "profile.json";

/// Save the profile summary as `<dir>/profile.json`, replacing any older copy
pub async fn save_profile(dir: &Path, profile: &ProfileSummary) -> Result<PathBuf> {
    let path = dir.join(PROFILE_FILE);
    write_json(&path, profile).await?;
    Ok(path)
}

/// Write pretty JSON through a temporary file so readers never see a torn document
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
