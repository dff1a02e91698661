//! HTTP transport for the reporting API: retries, pacing and credential redaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, StatusCode, Url};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adsync-http";

const SECRET_QUERY_KEYS: &[&str] = &["access_token", "appsecret_proof", "client_secret"];
const BODY_EXCERPT_CHARS: usize = 512;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Retry,
    GiveUp,
}

/// Throttling and server errors are retried.
pub fn step_after_status(status: StatusCode) -> NextStep {
    match status {
        StatusCode::TOO_MANY_REQUESTS => NextStep::Retry,
        s if s.is_server_error() => NextStep::Retry,
        _ => NextStep::GiveUp,
    }
}

pub fn step_after_error(err: &reqwest::Error) -> NextStep {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        NextStep::Retry
    } else {
        NextStep::GiveUp
    }
}

/// Doubling delay between retries, starting at `first_delay` and never above `delay_cap`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: usize,
    pub first_delay: Duration,
    pub delay_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(500),
            delay_cap: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry`, counting from zero.
    pub fn delay(&self, retry: usize) -> Duration {
        u32::try_from(retry)
            .ok()
            .and_then(|exp| 2u32.checked_pow(exp))
            .map_or(self.delay_cap, |factor| {
                self.first_delay.saturating_mul(factor).min(self.delay_cap)
            })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_account_concurrency: usize,
    pub retry: RetryPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 8,
            per_account_concurrency: 2,
            retry: RetryPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket of `per_minute` tokens refilled evenly across a minute.
    pub fn per_minute(per_minute: u32) -> Self {
        let per_minute = per_minute.max(1);
        Self {
            capacity: per_minute,
            refill_every: Duration::from_secs(60) / per_minute,
        }
    }
}

/// Request budget shared by every call through one fetcher. Holds at most
/// `capacity` tokens and regains one every `refill_every`.
#[derive(Debug)]
pub struct RequestBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    available: u32,
    refilled_at: Instant,
}

impl RequestBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_every: config.refill_every,
            state: Mutex::new(BucketState {
                available: config.capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Waits until a token is available, then spends it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let since = now.duration_since(state.refilled_at);
                if !self.refill_every.is_zero() && since >= self.refill_every {
                    let earned = u32::try_from(since.as_nanos() / self.refill_every.as_nanos())
                        .unwrap_or(u32::MAX);
                    state.available = state.available.saturating_add(earned).min(self.capacity);
                    state.refilled_at = now;
                }
                if state.available > 0 {
                    state.available -= 1;
                    return;
                }
                self.refill_every
                    .saturating_sub(now.duration_since(state.refilled_at))
                    .max(Duration::from_millis(1))
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Masks credential query parameters so URLs are safe to log or embed in errors.
pub fn redact_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return redact_unparsed(raw);
    };
    if url.query().is_none() {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if SECRET_QUERY_KEYS.contains(&k.as_ref()) {
                "REDACTED".to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), v)
        })
        .collect();
    url.query_pairs_mut().clear().extend_pairs(pairs);
    url.to_string()
}

fn redact_unparsed(raw: &str) -> String {
    let Some((head, query)) = raw.split_once('?') else {
        return raw.to_string();
    };
    let query = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((k, _)) if SECRET_QUERY_KEYS.contains(&k) => format!("{k}=REDACTED"),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{head}?{query}")
}

fn excerpt(body: &[u8]) -> String {
    String::from_utf8_lossy(body).chars().take(BODY_EXCERPT_CHARS).collect()
}

#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub status: StatusCode,
    /// Redacted final URL.
    pub url: String,
    pub body: JsonValue,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Response body excerpt when the server answered with an error status.
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { body, .. } => Some(body),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_account_limit: usize,
    per_account: Mutex<HashMap<String, Arc<Semaphore>>>,
    bucket: Option<Arc<RequestBucket>>,
    retry: RetryPolicy,
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
        let bucket = config.token_bucket.map(|c| Arc::new(RequestBucket::new(c)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_account_limit: config.per_account_concurrency.max(1),
            per_account: Mutex::new(HashMap::new()),
            bucket,
            retry: config.retry,
        })
    }

    async fn per_account_semaphore(&self, account: &str) -> Arc<Semaphore> {
        let mut map = self.per_account.lock().await;
        map.entry(account.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_account_limit)))
            .clone()
    }

    pub async fn get_json(
        &self,
        run_id: Uuid,
        account: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<JsonResponse, FetchError> {
        self.request_json(run_id, account, Method::GET, url, query).await
    }

    pub async fn post_json(
        &self,
        run_id: Uuid,
        account: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<JsonResponse, FetchError> {
        self.request_json(run_id, account, Method::POST, url, query).await
    }

    /// Sends the request, retrying transient failures with capped exponential backoff.
    pub async fn request_json(
        &self,
        run_id: Uuid,
        account: &str,
        method: Method,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<JsonResponse, FetchError> {
        let redacted = redact_url(url);
        let span = info_span!("http_request", %run_id, account, %method, url = %redacted);
        self.request_json_inner(account, method, url, query)
            .instrument(span)
            .await
    }

    async fn request_json_inner(
        &self,
        account: &str,
        method: Method,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<JsonResponse, FetchError> {
        // Semaphores are never closed, so acquisition cannot fail in practice.
        let _global = self.global_limit.acquire().await.ok();
        let per_account = self.per_account_semaphore(account).await;
        let _account = per_account.acquire().await.ok();

        if let Some(bucket) = &self.bucket {
            bucket.acquire().await;
        }

        let mut attempt = 0usize;
        loop {
            let resp_result = self
                .client
                .request(method.clone(), url)
                .query(query)
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = redact_url(resp.url().as_str());
                    let bytes = resp
                        .bytes()
                        .await
                        .map_err(|e| FetchError::Request(e.without_url()))?;

                    if status.is_success() {
                        let body = serde_json::from_slice(&bytes).map_err(|source| {
                            FetchError::Decode {
                                url: final_url.clone(),
                                source,
                            }
                        })?;
                        return Ok(JsonResponse {
                            status,
                            url: final_url,
                            body,
                        });
                    }

                    if step_after_status(status) == NextStep::Retry && attempt < self.retry.retries {
                        debug!(status = status.as_u16(), attempt, "retrying after http status");
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body: excerpt(&bytes),
                    });
                }
                Err(err) => {
                    let err = err.without_url();
                    if step_after_error(&err) == NextStep::Retry && attempt < self.retry.retries {
                        debug!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_from_the_default_until_the_cap() {
        let policy = RetryPolicy::default();
        let first = policy.first_delay;

        assert_eq!(policy.delay(0), first);
        assert_eq!(policy.delay(1), first * 2);
        assert_eq!(policy.delay(3), first * 8);
        assert_eq!(policy.delay(5), policy.delay_cap);
        assert_eq!(policy.delay(usize::MAX), policy.delay_cap);
    }

    #[test]
    fn graph_throttling_and_outages_are_retried() {
        assert_eq!(step_after_status(StatusCode::TOO_MANY_REQUESTS), NextStep::Retry);
        assert_eq!(step_after_status(StatusCode::SERVICE_UNAVAILABLE), NextStep::Retry);
        assert_eq!(step_after_status(StatusCode::BAD_REQUEST), NextStep::GiveUp);
        assert_eq!(step_after_status(StatusCode::UNAUTHORIZED), NextStep::GiveUp);
    }

    #[test]
    fn access_tokens_are_redacted() {
        let url = "https://graph.facebook.com/v18.0/123/insights?access_token=SECRET&limit=500&after=abc";
        let redacted = redact_url(url);
        assert!(!redacted.contains("SECRET"));
        assert!(redacted.contains("access_token=REDACTED"));
        assert!(redacted.contains("after=abc"));

        let unparsed = redact_url("/relative?access_token=SECRET&x=1");
        assert_eq!(unparsed, "/relative?access_token=REDACTED&x=1");
        assert_eq!(redact_url("https://example.com/a"), "https://example.com/a");
    }

    #[test]
    fn per_minute_bucket_spreads_refills() {
        let config = TokenBucketConfig::per_minute(120);
        assert_eq!(config.capacity, 120);
        assert_eq!(config.refill_every, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn drained_bucket_waits_for_the_next_refill() {
        let bucket = RequestBucket::new(TokenBucketConfig::per_minute(60));
        for _ in 0..60 {
            bucket.acquire().await;
        }
        let before = tokio::time::Instant::now();
        bucket.acquire().await;
        assert!(before.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn long_idle_refills_to_capacity() {
        let bucket = RequestBucket::new(TokenBucketConfig {
            capacity: 2,
            refill_every: Duration::from_millis(1),
        });
        bucket.acquire().await;
        bucket.acquire().await;

        // Exactly 2^32 refill periods; a wrapping count would earn nothing.
        tokio::time::advance(Duration::from_millis(1 << 32)).await;
        let before = tokio::time::Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }
}
