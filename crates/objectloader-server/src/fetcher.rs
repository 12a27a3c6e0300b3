//! HTTP fetcher for the object server
//!
//! # Endpoint Format
//!
//! - GET `{url}/objects/{stream}/{id}/single` → the object's JSON
//! - POST `{url}/api/getobjects/{stream}`
//!   - Request: `{"objects": "[\"id1\",\"id2\"]"}` (the id list, JSON-encoded as a string)
//!   - Response: `text/plain`, one `id\t{json}` line per object found

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use objectloader_core::{Fetcher, Item, LoaderError};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use tracing::{debug, trace, warn};

#[cfg(feature = "rate-limit")]
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
#[cfg(feature = "rate-limit")]
use std::num::NonZeroU32;
#[cfg(feature = "rate-limit")]
use std::sync::Arc;

use crate::error::ServerError;

/// Default timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default max retries
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds)
const RETRY_BASE_DELAY_MS: u64 = 500;

#[cfg(feature = "rate-limit")]
type ServerRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Connection settings for a [`ServerFetcher`]
#[derive(Clone)]
pub struct ServerOptions {
    /// Server base URL
    pub url: String,
    /// Stream (project) id
    pub stream: String,
    /// Bearer token, when the stream is private
    pub token: Option<String>,
    /// Extra headers sent with every request
    pub headers: BTreeMap<String, String>,
    pub timeout_secs: u64,
    /// Maximum retry attempts for transient failures
    pub max_retries: u32,
    /// Requests per second (only enforced with the `rate-limit` feature)
    pub requests_per_second: Option<u32>,
}

impl ServerOptions {
    pub fn new(url: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: stream.into(),
            token: None,
            headers: BTreeMap::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            requests_per_second: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_requests_per_second(mut self, rps: u32) -> Self {
        self.requests_per_second = Some(rps);
        self
    }
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("url", &self.url)
            .field("stream", &self.stream)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct GetObjectsRequest {
    /// JSON-encoded array of ids
    objects: String,
}

/// Fetches objects from a Speckle-style object server.
pub struct ServerFetcher {
    client: Client,
    options: ServerOptions,
    #[cfg(feature = "rate-limit")]
    rate_limiter: Option<Arc<ServerRateLimiter>>,
}

impl ServerFetcher {
    pub fn new(options: ServerOptions) -> Result<Self, ServerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_secs))
            .build()
            .map_err(|e| ServerError::Client(e.to_string()))?;

        #[cfg(feature = "rate-limit")]
        let rate_limiter = options
            .requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps))));

        Ok(Self {
            client,
            options,
            #[cfg(feature = "rate-limit")]
            rate_limiter,
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    #[cfg(feature = "rate-limit")]
    async fn wait_for_permit(&self) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }
    }

    #[cfg(not(feature = "rate-limit"))]
    async fn wait_for_permit(&self) {}

    fn base_url(&self) -> &str {
        self.options.url.trim_end_matches('/')
    }

    fn single_url(&self, id: &str) -> String {
        format!("{}/objects/{}/{}/single", self.base_url(), self.options.stream, id)
    }

    fn batch_url(&self) -> String {
        format!("{}/api/getobjects/{}", self.base_url(), self.options.stream)
    }

    fn authorize(&self, mut request: RequestBuilder) -> RequestBuilder {
        for (name, value) in &self.options.headers {
            request = request.header(name, value);
        }
        if let Some(ref token) = self.options.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        request
    }

    /// Run `attempt` until it succeeds, fails permanently or retries run out
    async fn with_retry<T, F, Fut>(&self, what: &str, mut attempt: F) -> Result<T, ServerError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ServerError>>,
    {
        let mut retry_delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for n in 0..=self.options.max_retries {
            self.wait_for_permit().await;

            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && n < self.options.max_retries => {
                    let delay = match e {
                        ServerError::RateLimited {
                            retry_after: Some(secs),
                        } => Duration::from_secs(secs),
                        _ => retry_delay,
                    };
                    warn!("{} failed ({}), retrying in {:?}", what, e, delay);
                    tokio::time::sleep(delay).await;
                    retry_delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }

        Err(ServerError::Unavailable(format!(
            "{} failed after retries",
            what
        )))
    }

    async fn send_single(&self, id: &str) -> Result<Item, ServerError> {
        let request = self.authorize(self.client.get(self.single_url(id)));
        let response = request.send().await.map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => {
                let body = response.text().await.map_err(transport_error)?;
                Item::from_json(&body)
                    .map_err(|e| ServerError::InvalidResponse(format!("object '{}': {}", id, e)))
            }
            StatusCode::NOT_FOUND => Err(ServerError::not_found(id)),
            status => Err(status_error(status, response).await),
        }
    }

    async fn send_batch(&self, ids: &[String]) -> Result<Vec<Item>, ServerError> {
        let objects = serde_json::to_string(ids)
            .map_err(|e| ServerError::InvalidResponse(format!("encoding ids: {}", e)))?;
        let request = self
            .authorize(self.client.post(self.batch_url()))
            .header("Accept", "text/plain")
            .json(&GetObjectsRequest { objects });
        let response = request.send().await.map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => {
                let body = response.text().await.map_err(transport_error)?;
                Ok(parse_object_lines(&body))
            }
            status => Err(status_error(status, response).await),
        }
    }
}

/// Parse `id\t{json}` lines. Lines that do not decode are skipped; the
/// downloader reports their ids as missing.
fn parse_object_lines(body: &str) -> Vec<Item> {
    let mut items = Vec::new();
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let Some((id, json)) = line.split_once('\t') else {
            warn!("Skipping object line without a tab separator");
            continue;
        };
        match Item::from_json(json) {
            Ok(item) if item.base_id == id => items.push(item),
            Ok(item) => warn!(
                "Skipping object line: id '{}' does not match body id '{}'",
                id, item.base_id
            ),
            Err(e) => warn!("Skipping object '{}': {}", id, e),
        }
    }
    items
}

fn transport_error(e: reqwest::Error) -> ServerError {
    if e.is_timeout() {
        ServerError::Unavailable("request timed out".into())
    } else if e.is_connect() {
        ServerError::Unavailable(format!("connection failed: {}", e))
    } else {
        ServerError::Unavailable(format!("request failed: {}", e))
    }
}

async fn status_error(status: StatusCode, response: reqwest::Response) -> ServerError {
    let retry_after = response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServerError::Auth(body),
        StatusCode::TOO_MANY_REQUESTS => ServerError::RateLimited { retry_after },
        s if s.is_server_error() => {
            ServerError::Unavailable(format!("status {}: {}", s.as_u16(), body))
        }
        s => ServerError::Status {
            status: s.as_u16(),
            body,
        },
    }
}

#[async_trait]
impl Fetcher for ServerFetcher {
    async fn fetch_single(&self, base_id: &str) -> Result<Item, LoaderError> {
        trace!("GET object '{}'", base_id);
        self.with_retry("single object request", || self.send_single(base_id))
            .await
            .map_err(|e| match e {
                ServerError::NotFound { id } => LoaderError::not_found(id),
                other => LoaderError::fetch(base_id, other.to_string()),
            })
    }

    async fn fetch_batch(&self, base_ids: &[String]) -> Result<Vec<Item>, LoaderError> {
        if base_ids.is_empty() {
            return Ok(Vec::new());
        }
        let items = self
            .with_retry("batch object request", || self.send_batch(base_ids))
            .await?;
        debug!("Fetched {} of {} objects", items.len(), base_ids.len());
        Ok(items)
    }
}

impl std::fmt::Debug for ServerFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerFetcher")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_options(server: &MockServer) -> ServerOptions {
        ServerOptions::new(server.uri(), "stream1")
            .with_token("test-token")
            .with_max_retries(1)
            .with_timeout(5)
    }

    fn object_json(id: &str) -> String {
        format!(r#"{{"id":"{}","speckle_type":"Base"}}"#, id)
    }

    #[test]
    fn test_parse_object_lines() {
        let body = format!(
            "a\t{}\nnot-a-line\nb\t{{broken\nc\t{}\n\n",
            object_json("a"),
            object_json("x")
        );
        let items = parse_object_lines(&body);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].base_id, "a");
        assert_eq!(items[0].size, Some(object_json("a").len()));
    }

    #[tokio::test]
    async fn test_fetch_single_success() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/objects/stream1/abc/single"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(object_json("abc")))
            .mount(&server)
            .await;

        let fetcher = ServerFetcher::new(test_options(&server)).unwrap();
        let item = fetcher.fetch_single("abc").await.unwrap();

        assert_eq!(item.base_id, "abc");
        assert_eq!(item.base.speckle_type, "Base");
    }

    #[tokio::test]
    async fn test_fetch_single_not_found() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/objects/stream1/gone/single"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = ServerFetcher::new(test_options(&server)).unwrap();
        let err = fetcher.fetch_single("gone").await.unwrap_err();

        assert!(matches!(err, LoaderError::NotFound { ref id } if id == "gone"));
    }

    #[tokio::test]
    async fn test_fetch_batch_posts_encoded_ids() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/getobjects/stream1"))
            .and(header("Authorization", "Bearer test-token"))
            .and(header("X-Client", "tests"))
            .and(body_json(serde_json::json!({ "objects": "[\"a\",\"b\",\"c\"]" })))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "a\t{}\nc\t{}\n",
                object_json("a"),
                object_json("c")
            )))
            .mount(&server)
            .await;

        let fetcher =
            ServerFetcher::new(test_options(&server).with_header("X-Client", "tests")).unwrap();
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let items = fetcher.fetch_batch(&ids).await.unwrap();

        let found: Vec<&str> = items.iter().map(|i| i.base_id.as_str()).collect();
        assert_eq!(found, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/getobjects/stream1"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = ServerFetcher::new(test_options(&server).with_max_retries(3)).unwrap();
        let err = fetcher.fetch_batch(&["a".to_string()]).await.unwrap_err();

        assert!(matches!(err, LoaderError::Origin(_)));
        assert!(err.to_string().contains("invalid token"));
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/objects/stream1/abc/single"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/objects/stream1/abc/single"))
            .respond_with(ResponseTemplate::new(200).set_body_string(object_json("abc")))
            .mount(&server)
            .await;

        let fetcher = ServerFetcher::new(test_options(&server)).unwrap();
        let item = fetcher.fetch_single("abc").await.unwrap();
        assert_eq!(item.base_id, "abc");
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let server = MockServer::start().await;
        let fetcher = ServerFetcher::new(test_options(&server)).unwrap();

        assert!(fetcher.fetch_batch(&[]).await.unwrap().is_empty());
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[test]
    fn test_debug_redacts_token() {
        let options = ServerOptions::new("https://example.com", "s").with_token("secret");
        let rendered = format!("{:?}", options);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
