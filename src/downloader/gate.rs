//! Verification gate: decide whether existing local content can be trusted.

use super::transfer::relocate_to_partial;
use crate::config::DownloadConfig;
use crate::session::Session;
use crate::utils::partial_path;
use std::path::Path;
use std::time::Duration;

/// Gate classification for one destination
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateDecision {
    /// Local content is trusted; no transfer
    Skip,
    /// Local content must be confirmed against the remote size
    NeedsVerify,
    /// The file must be transferred (fresh or resumed)
    NeedsDownload,
}

/// Local-first existence and size checks, with an optional HEAD confirmation
#[derive(Clone, Debug)]
pub struct VerificationGate {
    session: Session,
    strict: bool,
    head_timeout: Duration,
}

impl VerificationGate {
    /// Create a gate using the download settings
    pub fn new(session: Session, config: &DownloadConfig) -> Self {
        Self {
            session,
            strict: config.strict_verification,
            head_timeout: config.head_timeout,
        }
    }

    /// Classify `path` using local state only
    pub async fn classify(&self, path: &Path) -> GateDecision {
        if tokio::fs::try_exists(partial_path(path))
            .await
            .unwrap_or(false)
        {
            return GateDecision::NeedsDownload;
        }

        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                if self.strict {
                    GateDecision::NeedsVerify
                } else {
                    GateDecision::Skip
                }
            }
            _ => GateDecision::NeedsDownload,
        }
    }

    /// Resolve a [`GateDecision::NeedsVerify`] with a HEAD request
    ///
    /// Returns `Skip` when the remote size equals the local size. Otherwise the stale
    /// file is moved to the partial path (or deleted) and `NeedsDownload` is returned.
    /// A failed HEAD is treated as `NeedsDownload` without touching the file.
    pub async fn verify(&self, url: &str, path: &Path) -> GateDecision {
        let local = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => return GateDecision::NeedsDownload,
        };

        let Some(remote) = self.session.probe_size(url, self.head_timeout).await else {
            tracing::debug!(url = %url, "Remote size unknown, scheduling download");
            return GateDecision::NeedsDownload;
        };

        if remote == local {
            tracing::debug!(path = %path.display(), size = local, "Verified against remote size");
            return GateDecision::Skip;
        }

        tracing::info!(
            path = %path.display(),
            local_size = local,
            remote_size = remote,
            "Size mismatch, moving file aside for resume"
        );
        relocate_to_partial(path, &partial_path(path)).await;
        GateDecision::NeedsDownload
    }
}
