//! HTTP session capability
//!
//! A [`Session`] carries the HTTP client together with the headers and per-host
//! cookies resolved by whatever authenticated the user. It is passed explicitly into
//! every component that touches the network; nothing in the crate reads headers or
//! cookies from process-wide state.

use crate::error::{Error, ExtractError, Result};
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue, RANGE};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const USER_AGENT: &str = concat!("post-dl/", env!("CARGO_PKG_VERSION"));

/// Authenticated HTTP capability (cheap to clone)
#[derive(Clone, Debug)]
pub struct Session {
    client: reqwest::Client,
    headers: HeaderMap,
    /// host -> raw `Cookie` header value
    cookies: Arc<HashMap<String, String>>,
}

impl Session {
    /// Create a session with a default client and no credentials
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self::with_client(client))
    }

    /// Wrap an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            headers: HeaderMap::new(),
            cookies: Arc::new(HashMap::new()),
        }
    }

    /// Add a header sent with every request
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::config("headers", format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::config("headers", format!("invalid header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Add an `Authorization: Bearer` header
    pub fn with_bearer_token(self, token: &str) -> Result<Self> {
        self.with_header("Authorization", &format!("Bearer {token}"))
    }

    /// Attach a raw cookie string to requests for `host` and its subdomains
    pub fn with_cookie(mut self, host: &str, cookie: &str) -> Self {
        Arc::make_mut(&mut self.cookies).insert(host.to_ascii_lowercase(), cookie.to_string());
        self
    }

    fn cookie_for(&self, url: &str) -> Option<&str> {
        if self.cookies.is_empty() {
            return None;
        }
        let parsed = url::Url::parse(url).ok()?;
        let host = parsed.host_str()?.to_ascii_lowercase();
        self.cookies
            .iter()
            .find(|(domain, _)| host == **domain || host.ends_with(&format!(".{domain}")))
            .map(|(_, cookie)| cookie.as_str())
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .headers(self.headers.clone());
        if let Some(cookie) = self.cookie_for(url) {
            builder = builder.header(COOKIE, cookie);
        }
        builder
    }

    /// Issue a HEAD request
    pub async fn head(&self, url: &str, timeout: Duration) -> Result<reqwest::Response> {
        Ok(self
            .request(reqwest::Method::HEAD, url)
            .timeout(timeout)
            .send()
            .await?)
    }

    /// Best-effort remote size probe
    ///
    /// Returns `None` on any failure, a status >= 400, or a missing `Content-Length`.
    pub async fn probe_size(&self, url: &str, timeout: Duration) -> Option<u64> {
        match self.head(url, timeout).await {
            Ok(response) if response.status().as_u16() < 400 => content_length(response.headers()),
            Ok(response) => {
                tracing::debug!(url = %url, status = response.status().as_u16(), "HEAD rejected");
                None
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "HEAD failed");
                None
            }
        }
    }

    /// Issue a GET, optionally asking for the bytes from `range_start` onwards
    ///
    /// `timeout` bounds the wait for response headers; body reads are bounded by the caller.
    pub async fn get(
        &self,
        url: &str,
        range_start: Option<u64>,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let mut builder = self.request(reqwest::Method::GET, url);
        if let Some(start) = range_start {
            builder = builder.header(RANGE, format!("bytes={start}-"));
        }
        match tokio::time::timeout(timeout, builder.send()).await {
            Ok(response) => Ok(response?),
            Err(_) => Err(timed_out(url, timeout)),
        }
    }

    /// GET a JSON document, mapping HTTP errors to [`ExtractError::HttpStatus`]
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, timeout: Duration) -> Result<T> {
        let response = self
            .request(reqwest::Method::GET, url)
            .timeout(timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExtractError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }
            .into());
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| {
            ExtractError::Malformed {
                url: url.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// Read `Content-Length` from the headers
///
/// `reqwest::Response::content_length` reports the body size hint, which is zero for
/// HEAD responses, so the header is parsed directly.
pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

pub(crate) fn timed_out(url: &str, timeout: Duration) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("no response from {url} within {timeout:?}"),
    ))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_headers_and_cookies_are_attached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/thing"))
            .and(header("authorization", "Bearer t0ken"))
            .and(header("cookie", "session=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let session = Session::new()
            .unwrap()
            .with_bearer_token("t0ken")
            .unwrap()
            .with_cookie("127.0.0.1", "session=abc");

        let url = format!("{}/api/v1/thing", server.uri());
        let value: serde_json::Value = session.get_json(&url, Duration::from_secs(5)).await.unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn test_probe_size_reads_header() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/data/a.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Length", "1234")
                    .set_body_bytes(vec![0u8; 1234]),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/data/missing.bin"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let session = Session::new().unwrap();
        let size = session
            .probe_size(&format!("{}/data/a.bin", server.uri()), Duration::from_secs(5))
            .await;
        assert_eq!(size, Some(1234));

        let missing = session
            .probe_size(
                &format!("{}/data/missing.bin", server.uri()),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_get_json_maps_status_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let session = Session::new().unwrap();
        let err = session
            .get_json::<serde_json::Value>(&server.uri(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Extract(ExtractError::HttpStatus { status: 503, .. })
        ));
    }

    #[test]
    fn test_cookie_matches_subdomains_only() {
        let session = Session::new().unwrap().with_cookie("example.com", "a=1");
        assert_eq!(session.cookie_for("https://example.com/x"), Some("a=1"));
        assert_eq!(session.cookie_for("https://n1.example.com/x"), Some("a=1"));
        assert_eq!(session.cookie_for("https://badexample.com/x"), None);
    }
}
