//! On-disk cache of detail payloads, keyed by user and post ID.

use super::client::PostDetail;
use crate::error::Result;
use crate::utils::sanitize_filename;
use std::path::{Path, PathBuf};

/// Detail payloads stored as `<root>/<user>/<post id>.json`
#[derive(Clone, Debug)]
pub struct DetailCache {
    root: PathBuf,
}

impl DetailCache {
    /// Cache rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, user: &str, post_id: &str) -> PathBuf {
        self.root
            .join(sanitize_filename(user))
            .join(format!("{}.json", sanitize_filename(post_id)))
    }

    /// Cached payload, if present and readable
    ///
    /// Corrupt entries are reported and treated as misses.
    pub async fn load(&self, user: &str, post_id: &str) -> Option<PostDetail> {
        let path = self.entry_path(user, post_id);
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(detail) => Some(detail),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt cache entry");
                None
            }
        }
    }

    /// Store a payload
    pub async fn store(&self, user: &str, post_id: &str, detail: &PostDetail) -> Result<()> {
        let path = self.entry_path(user, post_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(detail)?;
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}
