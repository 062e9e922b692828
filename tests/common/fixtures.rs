//! Mock listing/detail API and file server

use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Service name used by every fixture
pub const SERVICE: &str = "svc";

/// Bytes served for the file `name` of post `post_id`
pub fn file_body(post_id: &str, name: &str) -> Vec<u8> {
    format!("{post_id}:{name}:")
        .into_bytes()
        .into_iter()
        .cycle()
        .take(256)
        .collect()
}

/// A mock site serving the API under `/api/v1` and files under `/data`
pub struct MockSite {
    /// Underlying mock server
    pub server: MockServer,
}

impl MockSite {
    /// Start an empty site
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Public profile link for `user`
    pub fn profile_link(&self, user: &str) -> String {
        format!("{}/{SERVICE}/user/{user}", self.server.uri())
    }

    /// Public post link
    pub fn post_link(&self, user: &str, post_id: &str) -> String {
        format!("{}/post/{post_id}", self.profile_link(user))
    }

    fn api(&self, user: &str, tail: &str) -> String {
        format!("/api/v1/{SERVICE}/user/{user}/{tail}")
    }

    /// Profile summary reporting `post_count` posts
    pub async fn mount_profile(&self, user: &str, post_count: u64) {
        Mock::given(method("GET"))
            .and(path(self.api(user, "profile")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": user,
                "name": format!("Creator {user}"),
                "service": SERVICE,
                "post_count": post_count,
                "indexed": "2024-01-01T00:00:00"
            })))
            .mount(&self.server)
            .await;
    }

    /// Failing profile summary
    pub async fn mount_missing_profile(&self, user: &str) {
        Mock::given(method("GET"))
            .and(path(self.api(user, "profile")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&self.server)
            .await;
    }

    /// Listing page at `offset` containing `post_ids`
    pub async fn mount_page(&self, user: &str, offset: u64, post_ids: &[&str]) {
        let items: Vec<serde_json::Value> = post_ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "id": id,
                    "user": user,
                    "service": SERVICE,
                    "title": format!("Post {id}")
                })
            })
            .collect();
        let mock = Mock::given(method("GET")).and(path(self.api(user, "posts")));
        let mock = if offset == 0 {
            mock.and(query_param_is_missing("o"))
        } else {
            mock.and(query_param("o", offset.to_string()))
        };
        mock.respond_with(ResponseTemplate::new(200).set_body_json(items))
            .mount(&self.server)
            .await;
    }

    /// Detail payload for `post_id` referencing `files`, plus the file bodies
    pub async fn mount_post(&self, user: &str, post_id: &str, files: &[&str]) {
        self.mount_detail(user, post_id, files).await;
        for name in files {
            self.mount_file(post_id, name).await;
        }
    }

    /// Detail payload for `post_id` referencing `files`, without serving them
    pub async fn mount_detail(&self, user: &str, post_id: &str, files: &[&str]) {
        let attachments: Vec<serde_json::Value> = files
            .iter()
            .map(|name| serde_json::json!({"name": name, "path": format!("/{post_id}/{name}")}))
            .collect();
        let previews: Vec<serde_json::Value> = files
            .iter()
            .map(|name| {
                serde_json::json!({
                    "server": self.server.uri(),
                    "name": name,
                    "path": format!("/{post_id}/{name}")
                })
            })
            .collect();

        Mock::given(method("GET"))
            .and(path(self.api(user, &format!("post/{post_id}"))))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "post": {
                    "id": post_id,
                    "user": user,
                    "service": SERVICE,
                    "title": format!("Post {post_id}"),
                    "attachments": attachments
                },
                "previews": previews
            })))
            .mount(&self.server)
            .await;
    }

    /// File body for `/data/<post_id>/<name>`
    pub async fn mount_file(&self, post_id: &str, name: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/data/{post_id}/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(file_body(post_id, name)))
            .mount(&self.server)
            .await;
    }

    /// File that always answers HTTP 500
    pub async fn mount_broken_file(&self, post_id: &str, name: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/data/{post_id}/{name}")))
            .respond_with(ResponseTemplate::new(500))
            .mount(&self.server)
            .await;
    }

    /// Favorites listing `page` (1-based) returning `accounts` as-is
    pub async fn mount_favorites(&self, page: usize, accounts: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/api/v1/account/favorites"))
            .and(query_param("page", page.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(accounts))
            .mount(&self.server)
            .await;
    }

    /// Number of requests received whose path starts with `prefix`
    pub async fn requests_to(&self, prefix: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path().starts_with(prefix))
            .count()
    }
}
