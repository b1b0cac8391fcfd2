//! JSON-over-HTTP transport shared by the remote API clients.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub use reqwest::Method;

pub const CRATE_NAME: &str = "gumsync-http";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Which failures a request may be resent after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// Reads and idempotent updates: timeouts, connect failures, 429 and 5xx.
    Idempotent,
    /// Creates: only 429 and connect failures, where the server did not act on the request.
    UnsentOnly,
}

impl Replay {
    fn allows_status(self, status: StatusCode) -> bool {
        match self {
            Replay::Idempotent => classify_status(status) == RetryDisposition::Retryable,
            Replay::UnsentOnly => status == StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn allows_error(self, err: &reqwest::Error) -> bool {
        match self {
            Replay::Idempotent => classify_reqwest_error(err) == RetryDisposition::Retryable,
            Replay::UnsentOnly => err.is_connect(),
        }
    }
}

/// Capped exponential backoff. Also drives the run-level retry cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// A bucket that sustains `per_second` requests with bursts of the same size.
    pub fn per_second(per_second: u32) -> Self {
        let per_second = per_second.max(1);
        Self {
            capacity: per_second,
            refill_every: Duration::from_secs(1) / per_second,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Whether a later attempt (e.g. the next scheduled run) could succeed.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Sends JSON requests with per-request retries and optional rate limiting.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            token_bucket,
            backoff: config.backoff,
        })
    }

    /// The underlying client, for building requests handed to [`Self::send_json`].
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends an idempotent `request`, retrying retryable failures, and decodes the body as JSON.
    ///
    /// Requests whose body cannot be cloned are sent exactly once.
    pub async fn send_json(
        &self,
        service: &'static str,
        request: RequestBuilder,
    ) -> Result<JsonValue, FetchError> {
        self.send_json_with(service, request, Replay::Idempotent).await
    }

    /// Like [`Self::send_json`], resending only failures that `replay` allows.
    pub async fn send_json_with(
        &self,
        service: &'static str,
        request: RequestBuilder,
        replay: Replay,
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_request", service, ?replay);
        self.send_with_retries(request, replay).instrument(span).await
    }

    async fn send_with_retries(&self, request: RequestBuilder, replay: Replay) -> Result<JsonValue, FetchError> {
        let mut current = request;
        let mut attempt = 0usize;

        loop {
            let retry_copy = if attempt < self.backoff.max_retries {
                current.try_clone()
            } else {
                None
            };

            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            match current.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let url = resp.url().to_string();

                    if status.is_success() {
                        return decode_body(resp, url).await;
                    }

                    let retry_after = retry_after(&resp);
                    if replay.allows_status(status) {
                        if let Some(next) = retry_copy {
                            let delay = retry_after
                                .unwrap_or_else(|| self.backoff.delay_for_attempt(attempt))
                                .min(self.backoff.max_delay);
                            warn!(%status, %url, attempt, ?delay, "retrying http request");
                            tokio::time::sleep(delay).await;
                            current = next;
                            attempt += 1;
                            continue;
                        }
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url,
                        body,
                    });
                }
                Err(err) => {
                    if replay.allows_error(&err) {
                        if let Some(next) = retry_copy {
                            let delay = self.backoff.delay_for_attempt(attempt);
                            warn!(error = %err, attempt, ?delay, "retrying http request");
                            tokio::time::sleep(delay).await;
                            current = next;
                            attempt += 1;
                            continue;
                        }
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

async fn decode_body(resp: Response, url: String) -> Result<JsonValue, FetchError> {
    let bytes = resp.bytes().await?;
    debug!(%url, bytes = bytes.len(), "http response received");
    if bytes.is_empty() {
        return Ok(JsonValue::Null);
    }
    serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode { url, source })
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}

/// Parses the delta-seconds form of `Retry-After`; HTTP dates are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<f64>().ok().and_then(|secs| {
        if secs.is_finite() && secs >= 0.0 {
            Some(Duration::from_secs_f64(secs))
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    fn quick_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(200),
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .expect("client")
    }

    async fn slow_page(State(hits): State<Arc<AtomicUsize>>) -> Json<JsonValue> {
        hits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        Json(json!({ "id": "late" }))
    }

    /// Answers `status` to the first `failures` requests, then 200.
    fn flaky_pages(hits: Arc<AtomicUsize>, failures: usize, status: StatusCode) -> Router {
        let handler = move |State(hits): State<Arc<AtomicUsize>>| async move {
            if hits.fetch_add(1, Ordering::SeqCst) < failures {
                (status, Json(json!({ "object": "error" })))
            } else {
                (StatusCode::OK, Json(json!({ "id": "page-1" })))
            }
        };
        Router::new().route("/pages", post(handler).get(handler)).with_state(hits)
    }

    #[tokio::test]
    async fn timed_out_create_is_sent_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(Router::new().route("/pages", post(slow_page)).with_state(hits.clone())).await;
        let fetcher = quick_fetcher();

        let request = fetcher.client().post(format!("{base}/pages")).json(&json!({ "parent": {} }));
        let err = fetcher
            .send_json_with("notion", request, Replay::UnsentOnly)
            .await
            .unwrap_err();
        assert!(matches!(&err, FetchError::Request(e) if e.is_timeout()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timed_out_idempotent_request_is_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(Router::new().route("/pages", post(slow_page)).with_state(hits.clone())).await;
        let fetcher = quick_fetcher();

        let request = fetcher.client().post(format!("{base}/pages")).json(&json!({ "page_size": 100 }));
        assert!(fetcher.send_json("notion", request).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn throttled_create_is_resent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(flaky_pages(hits.clone(), 1, StatusCode::TOO_MANY_REQUESTS)).await;
        let fetcher = quick_fetcher();

        let request = fetcher.client().post(format!("{base}/pages")).json(&json!({ "parent": {} }));
        let body = fetcher
            .send_json_with("notion", request, Replay::UnsentOnly)
            .await
            .expect("created");
        assert_eq!(body["id"], json!("page-1"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn create_answered_with_server_error_is_not_resent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(flaky_pages(hits.clone(), 1, StatusCode::BAD_GATEWAY)).await;
        let fetcher = quick_fetcher();

        let request = fetcher.client().post(format!("{base}/pages")).json(&json!({ "parent": {} }));
        let err = fetcher
            .send_json_with("notion", request, Replay::UnsentOnly)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 502, .. }));
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idempotent_read_recovers_from_server_errors() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(flaky_pages(hits.clone(), 2, StatusCode::SERVICE_UNAVAILABLE)).await;
        let fetcher = quick_fetcher();

        let body = fetcher
            .send_json("notion", fetcher.client().get(format!("{base}/pages")))
            .await
            .expect("recovered");
        assert_eq!(body["id"], json!("page-1"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
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
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_millis(350));
    }

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[test]
    fn status_errors_report_their_disposition() {
        let throttled = FetchError::HttpStatus {
            status: 429,
            url: "https://api.notion.com/v1/pages".into(),
            body: String::new(),
        };
        let invalid = FetchError::HttpStatus {
            status: 400,
            url: "https://api.notion.com/v1/pages".into(),
            body: "{\"code\":\"validation_error\"}".into(),
        };
        assert_eq!(throttled.disposition(), RetryDisposition::Retryable);
        assert_eq!(invalid.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn retry_after_accepts_delta_seconds_only() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 0.5 "), Some(Duration::from_millis(500)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after("-1"), None);
    }

    #[test]
    fn per_second_bucket_spreads_refills() {
        let cfg = TokenBucketConfig::per_second(4);
        assert_eq!(cfg.capacity, 4);
        assert_eq!(cfg.refill_every, Duration::from_millis(250));
        assert_eq!(TokenBucketConfig::per_second(0).capacity, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_waits_once_exhausted() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_secs(1));
        let started = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() < Duration::from_millis(10));
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
