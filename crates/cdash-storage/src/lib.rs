//! HTTP fetch utilities, on-disk response cache and database snapshot helpers.

pub mod snapshot;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a sibling temp file and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntryMeta {
    url: String,
    fetched_at: DateTime<Utc>,
    byte_size: usize,
}

/// Hash-addressed cache of successful GET bodies, valid for a fixed window.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    root: PathBuf,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    fn entry_paths(&self, url: &str) -> (PathBuf, PathBuf) {
        let key = sha256_hex(url.as_bytes());
        let dir = self.root.join(&key[..2]);
        (dir.join(format!("{key}.bin")), dir.join(format!("{key}.json")))
    }

    pub async fn lookup(&self, url: &str, now: DateTime<Utc>) -> anyhow::Result<Option<Vec<u8>>> {
        let (body_path, meta_path) = self.entry_paths(url);
        if !fs::try_exists(&meta_path).await.unwrap_or(false) {
            return Ok(None);
        }
        let meta: CacheEntryMeta = serde_json::from_slice(
            &fs::read(&meta_path)
                .await
                .with_context(|| format!("reading {}", meta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", meta_path.display()))?;
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        if meta.url != url || meta.fetched_at + ttl <= now {
            return Ok(None);
        }
        let body = fs::read(&body_path)
            .await
            .with_context(|| format!("reading {}", body_path.display()))?;
        Ok(Some(body))
    }

    pub async fn store(&self, url: &str, fetched_at: DateTime<Utc>, body: &[u8]) -> anyhow::Result<()> {
        let (body_path, meta_path) = self.entry_paths(url);
        write_atomic(&body_path, body).await?;
        let meta = CacheEntryMeta {
            url: url.to_string(),
            fetched_at,
            byte_size: body.len(),
        };
        let bytes = serde_json::to_vec(&meta).context("serializing cache entry")?;
        write_atomic(&meta_path, &bytes).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    RateLimited,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Whether a 403 is a quota refusal rather than a permission error. GitHub
/// sends `x-ratelimit-reset` on every response, so only an exhausted
/// `x-ratelimit-remaining` or an explicit `retry-after` counts.
pub fn is_quota_refusal(headers: &HeaderMap) -> bool {
    headers.contains_key(RETRY_AFTER)
        || headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == "0")
}

/// How long a throttled response asks us to wait, from `retry-after` or
/// `x-ratelimit-reset` (epoch seconds). `None` when neither header is usable.
pub fn rate_limit_wait(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    if let Some(secs) = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs));
    }

    let reset = headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())?;
    let reset_at = UNIX_EPOCH + Duration::from_secs(reset);
    Some(reset_at.duration_since(now).unwrap_or(Duration::ZERO))
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(10, Duration::from_secs(1))
    }
}

impl BackoffPolicy {
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    /// Upper bound on consecutive reset waits for one request.
    pub max_waits: usize,
    /// Added on top of the provider-reported wait.
    pub margin: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_waits: 10,
            margin: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub rate_limit: RateLimitPolicy,
    pub cache: Option<ResponseCache>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            rate_limit: RateLimitPolicy::default(),
            cache: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub from_cache: bool,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("still rate limited after {waits} waits for {url}")]
    RateLimitExhausted { url: String, waits: usize },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Observer of rate-limit sleeps: `(source_id, wait)`.
pub type RateLimitHook = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// Sequential HTTP client shared by every connector.
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    rate_limit: RateLimitPolicy,
    cache: Option<ResponseCache>,
    on_rate_limit: Option<RateLimitHook>,
}

impl fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("backoff", &self.backoff)
            .field("rate_limit", &self.rate_limit)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
            rate_limit: config.rate_limit,
            cache: config.cache,
            on_rate_limit: None,
        })
    }

    pub fn with_rate_limit_hook(mut self, hook: RateLimitHook) -> Self {
        self.on_rate_limit = Some(hook);
        self
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.get(source_id, url, &HeaderMap::new()).await
    }

    /// GET through the response cache when one is configured.
    pub async fn get(
        &self,
        source_id: &str,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        if let Some(cache) = &self.cache {
            match cache.lookup(url, Utc::now()).await {
                Ok(Some(body)) => {
                    debug!(source_id, url, "response cache hit");
                    return Ok(FetchedResponse {
                        status: StatusCode::OK,
                        final_url: url.to_string(),
                        headers: HeaderMap::new(),
                        body,
                        from_cache: true,
                    });
                }
                Ok(None) => {}
                Err(err) => warn!(source_id, url, error = %err, "response cache lookup failed"),
            }
        }

        let headers = headers.clone();
        let response = self
            .execute(source_id, url, |client| client.get(url).headers(headers.clone()))
            .await?;

        if let Some(cache) = &self.cache {
            if let Err(err) = cache.store(url, Utc::now(), &response.body).await {
                warn!(source_id, url, error = %err, "response cache store failed");
            }
        }
        Ok(response)
    }

    /// Sends the request produced by `build`, rebuilding it for every attempt.
    ///
    /// 5xx responses and transport timeouts are retried with the backoff policy.
    /// 403/429 responses carrying a reset hint sleep until the reset and repeat the
    /// same request; any other non-2xx status is returned as `HttpStatus`.
    pub async fn execute<F>(&self, source_id: &str, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let span = info_span!("http_fetch", source_id, url);
        async {
            let mut attempt = 0usize;
            let mut rate_limit_waits = 0usize;

            loop {
                let resp = match build(&self.client).send().await {
                    Ok(resp) => resp,
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(attempt, error = %err, "transient request error, retrying");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                };

                let status = resp.status();
                let final_url = resp.url().to_string();
                let headers = resp.headers().clone();

                if status.is_success() {
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        headers,
                        body,
                        from_cache: false,
                    });
                }

                match classify_status(status) {
                    RetryDisposition::RateLimited
                        if status == StatusCode::TOO_MANY_REQUESTS || is_quota_refusal(&headers) =>
                    {
                        if let Some(wait) = rate_limit_wait(&headers, SystemTime::now()) {
                            if rate_limit_waits >= self.rate_limit.max_waits {
                                return Err(FetchError::RateLimitExhausted {
                                    url: final_url,
                                    waits: rate_limit_waits,
                                });
                            }
                            rate_limit_waits += 1;
                            let wait = wait + self.rate_limit.margin;
                            warn!(
                                status = status.as_u16(),
                                wait_secs = wait.as_secs_f64(),
                                "rate limit exceeded, sleeping until reset"
                            );
                            if let Some(hook) = &self.on_rate_limit {
                                hook(source_id, wait);
                            }
                            tokio::time::sleep(wait).await;
                            continue;
                        }
                        if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.backoff.max_retries {
                            warn!(attempt, "throttled without reset hint, backing off");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                    }
                    RetryDisposition::Retryable if attempt < self.backoff.max_retries => {
                        warn!(attempt, status = status.as_u16(), "server error, retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    _ => {}
                }

                let body = resp.text().await.unwrap_or_default();
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body,
                });
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick_fetcher(cache: Option<ResponseCache>) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy::fixed(3, Duration::from_millis(10)),
            rate_limit: RateLimitPolicy {
                max_waits: 2,
                margin: Duration::ZERO,
            },
            cache,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let policy = BackoffPolicy::fixed(10, Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(1));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
    }

    #[test]
    fn statuses_are_classified() {
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::RateLimited);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::RateLimited);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn reset_header_is_converted_to_wait() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1030"));
        assert_eq!(rate_limit_wait(&headers, now), Some(Duration::from_secs(30)));

        headers.insert("x-ratelimit-reset", HeaderValue::from_static("900"));
        assert_eq!(rate_limit_wait(&headers, now), Some(Duration::ZERO));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(rate_limit_wait(&headers, now), Some(Duration::from_secs(7)));

        assert_eq!(rate_limit_wait(&HeaderMap::new(), now), None);
    }

    #[tokio::test]
    async fn cache_entries_expire_after_ttl() {
        let dir = tempdir().expect("tempdir");
        let cache = ResponseCache::new(dir.path(), Duration::from_secs(60));
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        cache
            .store("https://example.test/a", fetched_at, b"{\"ok\":true}")
            .await
            .expect("store");

        let fresh = cache
            .lookup("https://example.test/a", fetched_at + chrono::Duration::seconds(30))
            .await
            .expect("lookup");
        assert_eq!(fresh.as_deref(), Some(&b"{\"ok\":true}"[..]));

        let stale = cache
            .lookup("https://example.test/a", fetched_at + chrono::Duration::seconds(61))
            .await
            .expect("lookup");
        assert!(stale.is_none());

        let missing = cache
            .lookup("https://example.test/b", fetched_at)
            .await
            .expect("lookup");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let fetcher = quick_fetcher(None);
        let resp = fetcher
            .fetch_bytes("test", &format!("{}/flaky", server.uri()))
            .await
            .expect("retried fetch");
        assert_eq!(resp.body, b"ok");
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4)
            .mount(&server)
            .await;

        let fetcher = quick_fetcher(None);
        let err = fetcher
            .fetch_bytes("test", &format!("{}/down", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn other_statuses_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = quick_fetcher(None);
        let err = fetcher
            .fetch_bytes("test", &format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn rate_limited_request_waits_for_reset_and_repeats_same_page() {
        let server = MockServer::start().await;
        let reset = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 2;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "0")
                    .insert_header("x-ratelimit-reset", reset.to_string().as_str()),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[2]"))
            .expect(1)
            .mount(&server)
            .await;

        let waits = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&waits);
        let fetcher = quick_fetcher(None).with_rate_limit_hook(Arc::new(move |source: &str, _wait: Duration| {
            recorded.lock().unwrap().push(source.to_string());
        }));
        let resp = fetcher
            .fetch_bytes("test", &format!("{}/items?page=2", server.uri()))
            .await
            .expect("fetch after reset");
        let finished = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();

        assert_eq!(resp.body, b"[2]");
        assert!(finished >= reset, "request resumed before the reset time");
        assert_eq!(*waits.lock().unwrap(), vec!["test".to_string()]);
    }

    #[tokio::test]
    async fn forbidden_without_reset_hint_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/private"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = quick_fetcher(None);
        let err = fetcher
            .fetch_bytes("test", &format!("{}/private", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(403));
    }

    #[test]
    fn only_exhausted_quota_makes_forbidden_a_refusal() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1030"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4999"));
        assert!(!is_quota_refusal(&headers));

        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        assert!(is_quota_refusal(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("60"));
        assert!(is_quota_refusal(&headers));
    }

    #[tokio::test]
    async fn forbidden_with_quota_left_is_fatal_without_waiting() {
        let server = MockServer::start().await;
        let reset = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 1;
        Mock::given(method("GET"))
            .and(path("/scoped"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "4999")
                    .insert_header("x-ratelimit-reset", reset.to_string().as_str()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let waits = Arc::new(std::sync::Mutex::new(0usize));
        let recorded = Arc::clone(&waits);
        let fetcher = quick_fetcher(None).with_rate_limit_hook(Arc::new(move |_: &str, _: Duration| {
            *recorded.lock().unwrap() += 1;
        }));
        let err = fetcher
            .fetch_bytes("test", &format!("{}/scoped", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 403, .. }));
        assert_eq!(*waits.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn cached_get_skips_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cached"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"n\":1}"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let fetcher = quick_fetcher(Some(ResponseCache::new(dir.path(), Duration::from_secs(3600))));
        let url = format!("{}/cached", server.uri());

        let first = fetcher.fetch_bytes("test", &url).await.expect("first");
        let second = fetcher.fetch_bytes("test", &url).await.expect("second");

        assert!(!first.from_cache);
        assert!(second.from_cache);
        let value: serde_json::Value = second.json().expect("json");
        assert_eq!(value["n"], 1);
    }
}
