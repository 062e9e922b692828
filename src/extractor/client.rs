//! Listing/detail API client: link parsing, payload types, and the [`FetchClient`] seam.

use crate::config::{Backoff, RetryConfig};
use crate::error::{Error, ExtractError, Result};
use crate::retry::download_with_retry;
use crate::session::Session;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// A parsed profile or post link: `<scheme>://<host>/<service>/user/<user>[/post/<id>]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLink {
    origin: String,
    /// Service the user publishes on
    pub service: String,
    /// User ID
    pub user: String,
    /// Post ID, for single-post links
    pub post_id: Option<String>,
}

impl SourceLink {
    /// Parse a profile or post link
    ///
    /// # Examples
    ///
    /// ```
    /// use post_dl::extractor::SourceLink;
    ///
    /// let link = SourceLink::parse("https://example.su/fanbox/user/123/post/456").unwrap();
    /// assert_eq!(link.service, "fanbox");
    /// assert_eq!(link.post_id.as_deref(), Some("456"));
    /// assert_eq!(link.api_base(), "https://example.su/api/v1");
    /// ```
    pub fn parse(link: &str) -> Result<Self> {
        let unsupported = || Error::UnsupportedSource(link.to_string());
        let parsed = url::Url::parse(link.trim()).map_err(|_| unsupported())?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(unsupported());
        }

        let segments: Vec<&str> = parsed
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        let (service, user, post_id) = match segments.as_slice() {
            [service, "user", user] => (*service, *user, None),
            [service, "user", user, "post", id] => (*service, *user, Some(id.to_string())),
            _ => return Err(unsupported()),
        };

        Ok(Self {
            origin: parsed.origin().ascii_serialization(),
            service: service.to_string(),
            user: user.to_string(),
            post_id,
        })
    }

    /// Public server base, e.g. `https://host`
    pub fn server_base(&self) -> &str {
        &self.origin
    }

    /// API base, e.g. `https://host/api/v1`
    pub fn api_base(&self) -> String {
        format!("{}/api/v1", self.origin)
    }

    /// Link to the owning profile
    pub fn profile_link(&self) -> String {
        format!("{}/{}/user/{}", self.origin, self.service, self.user)
    }

    /// Public link to a post of this profile
    pub fn post_link(&self, post_id: &str) -> String {
        format!("{}/post/{}", self.profile_link(), post_id)
    }

    /// The same site and service for another user
    pub fn with_user(&self, user: &str) -> Self {
        Self {
            user: user.to_string(),
            post_id: None,
            ..self.clone()
        }
    }

    /// The same profile pointed at a single post
    pub fn with_post(&self, post_id: &str) -> Self {
        Self {
            post_id: Some(post_id.to_string()),
            ..self.clone()
        }
    }

    fn endpoint(&self, tail: &str) -> String {
        format!(
            "{}/{}/user/{}/{}",
            self.api_base(),
            self.service,
            self.user,
            tail
        )
    }
}

impl std::fmt::Display for SourceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.post_id {
            Some(id) => f.write_str(&self.post_link(id)),
            None => f.write_str(&self.profile_link()),
        }
    }
}

/// Profile summary returned by the profile endpoint
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    /// User ID
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Service
    #[serde(default)]
    pub service: String,
    /// Total number of posts
    #[serde(default)]
    pub post_count: u64,
    /// Any other fields the API reports (indexing dates, public ID, ...)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One entry of a listing page
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListingItem {
    /// Post ID
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Owning user ID
    #[serde(default, deserialize_with = "string_or_number")]
    pub user: String,
    /// Service
    #[serde(default)]
    pub service: String,
    /// Title
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
}

/// File or attachment reference inside a detail payload
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Server-relative path
    #[serde(default)]
    pub path: Option<String>,
    /// Server hosting the file (present on previews and top-level entries)
    #[serde(default)]
    pub server: Option<String>,
}

/// The `post` object of a detail payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailPost {
    /// Post ID
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Owning user ID
    #[serde(default, deserialize_with = "string_or_number")]
    pub user: String,
    /// Service
    #[serde(default)]
    pub service: String,
    /// Title
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    /// Main file
    #[serde(default)]
    pub file: Option<Attachment>,
    /// Attachments in publication order
    #[serde(default, deserialize_with = "null_as_default")]
    pub attachments: Vec<Attachment>,
}

/// Detail payload: the post plus the server-resolved file lists
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDetail {
    /// The post itself
    pub post: DetailPost,
    /// Preview entries (carry `server`)
    #[serde(default, deserialize_with = "null_as_default")]
    pub previews: Vec<Attachment>,
    /// Top-level attachment entries
    #[serde(default, deserialize_with = "null_as_default")]
    pub attachments: Vec<Attachment>,
    /// Top-level video entries
    #[serde(default, deserialize_with = "null_as_default")]
    pub videos: Vec<Attachment>,
}

/// A favorite account as reported by the favorites endpoint
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FavoriteAccount {
    /// Internal account ID
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    /// Public ID used in profile links, when it differs from `id`
    #[serde(default, deserialize_with = "null_as_default")]
    pub public_id: Option<String>,
    /// Display name
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    /// Service
    #[serde(default, deserialize_with = "null_as_default")]
    pub service: String,
}

impl FavoriteAccount {
    /// Profile link on `site`, preferring the public ID over the internal one
    ///
    /// Returns `None` when the account has no usable ID or service.
    pub fn source_link(&self, site: &str) -> Option<SourceLink> {
        let user = self
            .public_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .or(Some(self.id.as_str()).filter(|id| !id.is_empty()))?;
        if self.service.is_empty() {
            return None;
        }
        SourceLink::parse(&format!(
            "{}/{}/user/{}",
            site.trim_end_matches('/'),
            self.service,
            user
        ))
        .ok()
    }
}

/// Favorites payload: either a bare list or a list wrapped in an object
#[derive(Deserialize)]
#[serde(untagged)]
enum FavoritesListing {
    Accounts(Vec<FavoriteAccount>),
    Wrapped {
        #[serde(alias = "data", alias = "accounts", alias = "items")]
        favorites: Vec<FavoriteAccount>,
    },
}

impl FavoritesListing {
    fn into_accounts(self) -> Vec<FavoriteAccount> {
        match self {
            FavoritesListing::Accounts(accounts) => accounts,
            FavoritesListing::Wrapped { favorites } => favorites,
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Abstraction over the listing/detail API, enabling testability
#[async_trait::async_trait]
pub trait FetchClient: Send + Sync {
    /// Fetch the profile summary (needed for the total post count)
    async fn fetch_profile(&self, link: &SourceLink) -> Result<ProfileSummary>;

    /// Fetch the listing page starting at `offset`
    async fn fetch_page(&self, link: &SourceLink, offset: u64) -> Result<Vec<ListingItem>>;

    /// Fetch the detail payload of one post
    async fn fetch_detail(&self, link: &SourceLink, post_id: &str) -> Result<PostDetail>;

    /// Fetch one page (1-based) of the session's favorite accounts on `site`
    ///
    /// `site` is the public server base, e.g. `https://host`. The session must
    /// already carry the account's credentials.
    async fn fetch_favorites(
        &self,
        site: &str,
        page: usize,
        limit: usize,
    ) -> Result<Vec<FavoriteAccount>>;
}

/// Production [`FetchClient`] over HTTP
///
/// Every call goes through [`download_with_retry`] with linear backoff of
/// `retry_unit * n`. Profile, listing and favorites calls make three attempts,
/// detail calls make four. An HTTP 403 on a detail call is treated as rate
/// limiting and waits four times longer. Malformed payloads are not retried.
#[derive(Clone, Debug)]
pub struct HttpFetchClient {
    session: Session,
    timeout: Duration,
    page_retry: RetryConfig,
    detail_retry: RetryConfig,
}

const PAGE_ATTEMPTS: u32 = 3;
const DETAIL_ATTEMPTS: u32 = 4;

fn linear_retry(max_attempts: u32, unit: Duration) -> RetryConfig {
    RetryConfig {
        max_attempts,
        backoff_factor: unit,
        backoff: Backoff::Linear,
        ..RetryConfig::default()
    }
}

impl HttpFetchClient {
    /// Create a client with the given per-request timeout
    pub fn new(session: Session, timeout: Duration) -> Self {
        Self {
            session,
            timeout,
            page_retry: linear_retry(PAGE_ATTEMPTS, Duration::from_millis(500)),
            detail_retry: linear_retry(DETAIL_ATTEMPTS, Duration::from_millis(500)),
        }
    }

    /// Override the base retry sleep (default 0.5s)
    pub fn with_retry_unit(mut self, unit: Duration) -> Self {
        self.page_retry.backoff_factor = unit;
        self.detail_retry.backoff_factor = unit;
        self
    }

    async fn get_json<T>(&self, url: &str, retry: &RetryConfig) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        download_with_retry(retry, || self.session.get_json::<T>(url, self.timeout)).await
    }
}

#[async_trait::async_trait]
impl FetchClient for HttpFetchClient {
    async fn fetch_profile(&self, link: &SourceLink) -> Result<ProfileSummary> {
        self.get_json(&link.endpoint("profile"), &self.page_retry)
            .await
    }

    async fn fetch_page(&self, link: &SourceLink, offset: u64) -> Result<Vec<ListingItem>> {
        let url = if offset == 0 {
            link.endpoint("posts")
        } else {
            format!("{}?o={offset}", link.endpoint("posts"))
        };
        self.get_json(&url, &self.page_retry).await
    }

    async fn fetch_detail(&self, link: &SourceLink, post_id: &str) -> Result<PostDetail> {
        let url = link.endpoint(&format!("post/{post_id}"));
        let url = url.as_str();
        let (session, timeout) = (&self.session, self.timeout);
        download_with_retry(&self.detail_retry, || async move {
            match session.get_json::<PostDetail>(url, timeout).await {
                Err(Error::Extract(ExtractError::HttpStatus { status: 403, .. })) => {
                    Err(ExtractError::RateLimited {
                        post_id: post_id.to_string(),
                    }
                    .into())
                }
                other => other,
            }
        })
        .await
    }

    async fn fetch_favorites(
        &self,
        site: &str,
        page: usize,
        limit: usize,
    ) -> Result<Vec<FavoriteAccount>> {
        let url = format!(
            "{}/api/v1/account/favorites?page={page}&limit={limit}",
            site.trim_end_matches('/')
        );
        let listing: FavoritesListing = self.get_json(&url, &self.page_retry).await?;
        Ok(listing.into_accounts())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> HttpFetchClient {
        HttpFetchClient::new(Session::new().unwrap(), Duration::from_secs(5))
            .with_retry_unit(Duration::from_millis(1))
    }

    #[test]
    fn test_parse_profile_and_post_links() {
        let profile = SourceLink::parse("https://host.example/patreon/user/42/").unwrap();
        assert_eq!(profile.service, "patreon");
        assert_eq!(profile.user, "42");
        assert_eq!(profile.post_id, None);
        assert_eq!(profile.server_base(), "https://host.example");
        assert_eq!(profile.to_string(), "https://host.example/patreon/user/42");

        let post = SourceLink::parse("http://127.0.0.1:8080/svc/user/u/post/9").unwrap();
        assert_eq!(post.post_id.as_deref(), Some("9"));
        assert_eq!(post.api_base(), "http://127.0.0.1:8080/api/v1");
        assert_eq!(post.post_link("9"), "http://127.0.0.1:8080/svc/user/u/post/9");
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        for link in [
            "not a link",
            "ftp://host/svc/user/1",
            "https://host/svc/1",
            "https://host/svc/user/1/posts",
            "https://host/",
        ] {
            assert!(
                matches!(SourceLink::parse(link), Err(Error::UnsupportedSource(_))),
                "{link} should be rejected"
            );
        }
    }

    #[test]
    fn test_detail_payload_tolerates_nulls_and_numbers() {
        let json = serde_json::json!({
            "post": {
                "id": 123,
                "user": "u",
                "service": "svc",
                "title": null,
                "file": {},
                "attachments": null
            },
            "previews": [{"server": "https://n1.host", "path": "/ab/x.png", "name": "x.png"}],
            "videos": null
        });
        let detail: PostDetail = serde_json::from_value(json).unwrap();
        assert_eq!(detail.post.id, "123");
        assert_eq!(detail.post.title, "");
        assert!(detail.post.attachments.is_empty());
        assert_eq!(detail.post.file, Some(Attachment::default()));
        assert_eq!(detail.previews.len(), 1);
        assert!(detail.videos.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_page_uses_offset_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/svc/user/u/posts"))
            .and(query_param("o", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "2", "user": "u", "service": "svc", "title": "two"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let link = SourceLink::parse(&format!("{}/svc/user/u", server.uri())).unwrap();
        let page = client().fetch_page(&link, 50).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].title, "two");
    }

    #[tokio::test]
    async fn test_fetch_profile_retries_three_times() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/svc/user/u/profile"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let link = SourceLink::parse(&format!("{}/svc/user/u", server.uri())).unwrap();
        let err = client().fetch_profile(&link).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Extract(ExtractError::HttpStatus { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_detail_reports_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/svc/user/u/post/7"))
            .respond_with(ResponseTemplate::new(403))
            .expect(4)
            .mount(&server)
            .await;

        let link = SourceLink::parse(&format!("{}/svc/user/u", server.uri())).unwrap();
        let err = client().fetch_detail(&link, "7").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Extract(ExtractError::RateLimited { ref post_id }) if post_id == "7"
        ));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_fetched_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/svc/user/u/post/8"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/svc/user/u/profile"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .expect(1)
            .mount(&server)
            .await;

        let link = SourceLink::parse(&format!("{}/svc/user/u", server.uri())).unwrap();
        let client = client();
        let err = client.fetch_detail(&link, "8").await.unwrap_err();
        assert!(matches!(err, Error::Extract(ExtractError::Malformed { .. })));
        let err = client.fetch_profile(&link).await.unwrap_err();
        assert!(matches!(err, Error::Extract(ExtractError::Malformed { .. })));
    }

    #[tokio::test]
    async fn test_fetch_favorites_accepts_bare_and_wrapped_lists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/account/favorites"))
            .and(query_param("page", "1"))
            .and(query_param("limit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "a1", "public_id": "alice", "name": "Alice", "service": "svc"},
                {"id": 42, "public_id": null, "name": "Bob", "service": "svc"}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/account/favorites"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "c3", "service": "svc"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client();
        let first = client.fetch_favorites(&server.uri(), 1, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].public_id.as_deref(), Some("alice"));
        assert_eq!(first[1].id, "42");
        assert_eq!(first[1].public_id, None);

        let second = client.fetch_favorites(&server.uri(), 2, 2).await.unwrap();
        assert_eq!(second[0].id, "c3");
    }

    #[test]
    fn test_favorite_link_prefers_public_id() {
        let site = "https://host.example/";
        let account = FavoriteAccount {
            id: "internal".into(),
            public_id: Some("public".into()),
            service: "svc".into(),
            ..Default::default()
        };
        assert_eq!(
            account.source_link(site).unwrap().to_string(),
            "https://host.example/svc/user/public"
        );

        let fallback = FavoriteAccount {
            public_id: Some(String::new()),
            ..account.clone()
        };
        assert_eq!(fallback.source_link(site).unwrap().user, "internal");

        let anonymous = FavoriteAccount {
            id: String::new(),
            public_id: None,
            ..account.clone()
        };
        assert_eq!(anonymous.source_link(site), None);

        let no_service = FavoriteAccount {
            service: String::new(),
            ..account
        };
        assert_eq!(no_service.source_link(site), None);
    }
}
