//! Resumable single-file transfer: HEAD probe, byte-range resume, atomic finalize.

use crate::config::{Config, RetryConfig};
use crate::error::{Error, Result, TransferError};
use crate::retry::{IsRetryable, download_with_retry};
use crate::session::{Session, content_length, timed_out};
use crate::types::{Event, TransferOutcome};
use crate::utils::partial_path;
use futures::StreamExt;
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Minimum number of bytes between two progress events for the same file
const PROGRESS_STEP_BYTES: u64 = 1024 * 1024;

/// Downloads one URL to one path, resuming from `<path>.part` when possible
///
/// The partial file is kept across retries and across process restarts; it is only
/// removed when the server proves it unusable (HTTP 416, or a full response to a
/// ranged request) or when it is renamed into place.
#[derive(Clone, Debug)]
pub struct TransferEngine {
    session: Session,
    retry: RetryConfig,
    head_timeout: Duration,
    get_timeout: Duration,
    chunk_size: usize,
    events: Option<tokio::sync::broadcast::Sender<Event>>,
}

impl TransferEngine {
    /// Create an engine using the download and retry settings of `config`
    pub fn new(session: Session, config: &Config) -> Self {
        Self {
            session,
            retry: config.retry.clone(),
            head_timeout: config.download.head_timeout,
            get_timeout: config.download.get_timeout,
            chunk_size: config.download.chunk_size.max(1),
            events: None,
        }
    }

    /// Emit [`Event::TransferProgress`] on this channel
    pub fn with_events(mut self, events: tokio::sync::broadcast::Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    /// The session used for requests
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Download `url` to `dest`
    ///
    /// Returns [`TransferOutcome::Downloaded`] when bytes were transferred, or
    /// [`TransferOutcome::Skipped`] when the final file already matched the remote
    /// size. Retryable failures are retried with exponential backoff; once the
    /// attempts run out the error is [`TransferError::ExhaustedRetries`] and the
    /// partial file stays on disk for a later run.
    pub async fn transfer(&self, url: &str, dest: &Path) -> Result<TransferOutcome> {
        let mut attempts = 0u32;
        let result = download_with_retry(&self.retry, || {
            attempts += 1;
            self.attempt(url, dest)
        })
        .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_retryable() => Err(TransferError::ExhaustedRetries {
                url: url.to_string(),
                attempts,
                last_error: e.to_string(),
            }
            .into()),
            Err(e) => Err(e),
        }
    }

    async fn attempt(&self, url: &str, dest: &Path) -> Result<TransferOutcome> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(dest);
        let remote_size = self.session.probe_size(url, self.head_timeout).await;

        let partial_len = file_len(&partial).await;
        if let Some(local) = file_len(dest).await {
            if partial_len.is_some() {
                // An existing partial always wins over the final file
                tracing::debug!(path = %dest.display(), "Partial present, discarding final file");
                tokio::fs::remove_file(dest).await?;
            } else if remote_size == Some(local) {
                tracing::debug!(path = %dest.display(), size = local, "Final file matches remote size");
                return Ok(TransferOutcome::Skipped);
            } else {
                tracing::info!(
                    path = %dest.display(),
                    local_size = local,
                    remote_size = ?remote_size,
                    "Final file size differs from remote, resuming"
                );
                relocate_to_partial(dest, &partial).await;
            }
        }

        let resume_from = file_len(&partial).await.filter(|len| *len > 0);
        match self.fetch_into(url, &partial, resume_from, remote_size).await {
            Err(Error::Transfer(TransferError::RangeNotSatisfiable { offset, .. })) => {
                tracing::warn!(url = %url, offset, "Range rejected, restarting from zero");
                remove_if_exists(&partial).await?;
                self.fetch_into(url, &partial, None, remote_size).await?;
            }
            other => {
                other?;
            }
        }

        finalize(&partial, dest).await?;
        Ok(TransferOutcome::Downloaded)
    }

    /// Stream the body of `url` into `partial`; returns the partial's final length
    async fn fetch_into(
        &self,
        url: &str,
        partial: &Path,
        resume_from: Option<u64>,
        remote_size: Option<u64>,
    ) -> Result<u64> {
        let response = self.session.get(url, resume_from, self.get_timeout).await?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(TransferError::RangeNotSatisfiable {
                url: url.to_string(),
                offset: resume_from.unwrap_or(0),
            }
            .into());
        }
        if status.as_u16() >= 400 {
            return Err(TransferError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }
            .into());
        }

        let append_from = match resume_from {
            Some(offset) if status == StatusCode::PARTIAL_CONTENT => {
                match content_range_start(response.headers()) {
                    Some(start) if start != offset => {
                        // Treated like a rejected range so the caller restarts cleanly
                        return Err(TransferError::RangeNotSatisfiable {
                            url: url.to_string(),
                            offset,
                        }
                        .into());
                    }
                    _ => Some(offset),
                }
            }
            Some(offset) => {
                tracing::warn!(
                    url = %url,
                    offset,
                    status = status.as_u16(),
                    "Server ignored range request, discarding partial"
                );
                None
            }
            None => None,
        };

        let body_len = content_length(response.headers());
        let expected = match append_from {
            Some(offset) => body_len.map(|len| len + offset).or(remote_size),
            None => body_len.or(remote_size),
        };

        let file = match append_from {
            Some(_) => {
                tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(partial)
                    .await?
            }
            None => tokio::fs::File::create(partial).await?,
        };
        let mut writer = tokio::io::BufWriter::with_capacity(self.chunk_size, file);

        let mut written = append_from.unwrap_or(0);
        let mut last_reported = written;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::time::timeout(self.get_timeout, stream.next())
                .await
                .map_err(|_| timed_out(url, self.get_timeout))?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;

            if written - last_reported >= PROGRESS_STEP_BYTES {
                last_reported = written;
                self.report_progress(url, written, expected);
            }
        }
        writer.flush().await?;
        self.report_progress(url, written, expected);

        if let Some(expected) = expected
            && written < expected
        {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("body ended at {written} of {expected} bytes for {url}"),
            )));
        }

        Ok(written)
    }

    fn report_progress(&self, url: &str, downloaded: u64, total: Option<u64>) {
        if let Some(events) = &self.events {
            events
                .send(Event::TransferProgress {
                    url: url.to_string(),
                    downloaded,
                    total,
                })
                .ok();
        }
    }
}

/// Move a stale final file to the partial path, deleting it if the move fails
pub(crate) async fn relocate_to_partial(dest: &Path, partial: &Path) {
    if let Err(e) = tokio::fs::rename(dest, partial).await {
        tracing::warn!(path = %dest.display(), error = %e, "Could not move file to partial, deleting it");
        if let Err(e) = tokio::fs::remove_file(dest).await {
            tracing::warn!(path = %dest.display(), error = %e, "Failed to delete stale file");
        }
    }
}

/// Rename the partial into place, falling back to copy-then-delete
async fn finalize(partial: &Path, dest: &Path) -> Result<()> {
    match tokio::fs::rename(partial, dest).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tracing::debug!(
                path = %dest.display(),
                error = %rename_err,
                "Rename failed, copying partial into place"
            );
            tokio::fs::copy(partial, dest)
                .await
                .map_err(|e| TransferError::Finalize {
                    path: dest.to_path_buf(),
                    reason: format!("rename failed ({rename_err}), copy failed ({e})"),
                })?;
            if let Err(e) = tokio::fs::remove_file(partial).await {
                tracing::warn!(path = %partial.display(), error = %e, "Failed to remove partial after copy");
            }
            Ok(())
        }
    }
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// First byte of a `Content-Range: bytes <start>-<end>/<total>` header
fn content_range_start(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let value = headers.get(reqwest::header::CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes ")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn engine(max_attempts: u32) -> TransferEngine {
        let mut config = Config::default();
        config.retry.max_attempts = max_attempts;
        config.retry.backoff_factor = Duration::from_millis(10);
        config.download.head_timeout = Duration::from_secs(2);
        config.download.get_timeout = Duration::from_secs(5);
        TransferEngine::new(Session::new().unwrap(), &config)
    }

    async fn mount_head(server: &MockServer, file: &str, len: usize) {
        Mock::given(method("HEAD"))
            .and(path(file))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Length", len.to_string().as_str())
                    .set_body_bytes(vec![0u8; len]),
            )
            .mount(server)
            .await;
    }

    /// Serves `Range: bytes=N-` requests with 206 and the matching suffix
    struct RangeResponder(Vec<u8>);

    impl Respond for RangeResponder {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let start = request
                .headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("bytes="))
                .and_then(|v| v.trim_end_matches('-').parse::<usize>().ok());
            match start {
                Some(start) if start < self.0.len() => ResponseTemplate::new(206)
                    .insert_header(
                        "Content-Range",
                        format!("bytes {}-{}/{}", start, self.0.len() - 1, self.0.len()).as_str(),
                    )
                    .set_body_bytes(self.0[start..].to_vec()),
                Some(_) => ResponseTemplate::new(416),
                None => ResponseTemplate::new(200).set_body_bytes(self.0.clone()),
            }
        }
    }

    #[tokio::test]
    async fn test_fresh_download() {
        let server = MockServer::start().await;
        let data = body(10_000);
        mount_head(&server, "/data/a.bin", data.len()).await;
        Mock::given(method("GET"))
            .and(path("/data/a.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("nested/1-a.bin");
        let outcome = engine(3)
            .transfer(&format!("{}/data/a.bin", server.uri()), &dest)
            .await
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Downloaded);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_resume_sends_range_and_appends() {
        let server = MockServer::start().await;
        let data = body(5_000);
        mount_head(&server, "/data/r.bin", data.len()).await;
        Mock::given(method("GET"))
            .and(path("/data/r.bin"))
            .and(header("range", "bytes=2000-"))
            .respond_with(RangeResponder(data.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("1-r.bin");
        std::fs::write(partial_path(&dest), &data[..2000]).unwrap();

        let outcome = engine(3)
            .transfer(&format!("{}/data/r.bin", server.uri()), &dest)
            .await
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Downloaded);
        let written = std::fs::read(&dest).unwrap();
        assert_eq!(written.len(), data.len());
        assert_eq!(written, data);
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_ignored_range_discards_partial() {
        let server = MockServer::start().await;
        let data = body(3_000);
        mount_head(&server, "/data/full.bin", data.len()).await;
        // Always answers 200 with the full body, even for ranged requests
        Mock::given(method("GET"))
            .and(path("/data/full.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("1-full.bin");
        std::fs::write(partial_path(&dest), b"garbage prefix").unwrap();

        engine(3)
            .transfer(&format!("{}/data/full.bin", server.uri()), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_range_not_satisfiable_restarts_from_zero() {
        let server = MockServer::start().await;
        let data = body(1_000);
        mount_head(&server, "/data/s.bin", data.len()).await;
        Mock::given(method("GET"))
            .and(path("/data/s.bin"))
            .and(header_exists("range"))
            .respond_with(ResponseTemplate::new(416))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data/s.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("1-s.bin");
        // Longer than the remote file, so the range is unsatisfiable
        std::fs::write(partial_path(&dest), body(2_000)).unwrap();

        engine(3)
            .transfer(&format!("{}/data/s.bin", server.uri()), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_matching_final_file_issues_no_get() {
        let server = MockServer::start().await;
        let data = body(512);
        mount_head(&server, "/data/done.bin", data.len()).await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .expect(0)
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("1-done.bin");
        std::fs::write(&dest, &data).unwrap();

        let outcome = engine(3)
            .transfer(&format!("{}/data/done.bin", server.uri()), &dest)
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_mismatched_final_file_is_resumed() {
        let server = MockServer::start().await;
        let data = body(4_096);
        mount_head(&server, "/data/m.bin", data.len()).await;
        Mock::given(method("GET"))
            .and(path("/data/m.bin"))
            .and(header("range", "bytes=1000-"))
            .respond_with(RangeResponder(data.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("1-m.bin");
        std::fs::write(&dest, &data[..1000]).unwrap();

        engine(3)
            .transfer(&format!("{}/data/m.bin", server.uri()), &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_exhausted_retries_keeps_partial() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/broken.bin"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("1-broken.bin");
        std::fs::write(partial_path(&dest), b"keep me").unwrap();

        let err = engine(2)
            .transfer(&format!("{}/data/broken.bin", server.uri()), &dest)
            .await
            .unwrap_err();

        match err {
            Error::Transfer(TransferError::ExhaustedRetries {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("503"), "last error: {last_error}");
            }
            other => panic!("expected ExhaustedRetries, got {other:?}"),
        }
        assert_eq!(std::fs::read(partial_path(&dest)).unwrap(), b"keep me");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let server = MockServer::start().await;
        let data = body(2_048);
        Mock::given(method("GET"))
            .and(path("/data/flaky.bin"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data/flaky.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("1-flaky.bin");
        engine(3)
            .transfer(&format!("{}/data/flaky.bin", server.uri()), &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_progress_events_report_final_size() {
        let server = MockServer::start().await;
        let data = body(3 * 1024 * 1024);
        Mock::given(method("GET"))
            .and(path("/data/big.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .mount(&server)
            .await;

        let (tx, mut rx) = tokio::sync::broadcast::channel(1024);
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("1-big.bin");
        engine(1)
            .with_events(tx)
            .transfer(&format!("{}/data/big.bin", server.uri()), &dest)
            .await
            .unwrap();

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if let Event::TransferProgress { downloaded, .. } = event {
                last = Some(downloaded);
            }
        }
        assert_eq!(last, Some(data.len() as u64));
    }

    #[test]
    fn test_content_range_start() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_RANGE,
            "bytes 100-199/200".parse().unwrap(),
        );
        assert_eq!(content_range_start(&headers), Some(100));
        headers.insert(reqwest::header::CONTENT_RANGE, "bytes */200".parse().unwrap());
        assert_eq!(content_range_start(&headers), None);
    }
}
