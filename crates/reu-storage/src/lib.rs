//! HTTP fetch utilities and program persistence for the REU pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub mod postgres;
pub mod store;

pub use postgres::PgProgramStore;
pub use store::{InMemoryProgramStore, ProgramFilter, ProgramStore, StoreError};

pub const CRATE_NAME: &str = "reu-storage";

pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// How a single fetch reacts to failures.
#[derive(Debug, Clone, Copy)]
pub enum RetryPolicy {
    /// One attempt; failures go straight back to the caller.
    Once,
    /// Retry server errors, 429s and transient transport errors.
    Classified(BackoffPolicy),
    /// Retry every transport error and non-2xx status.
    AnyFailure(BackoffPolicy),
}

impl RetryPolicy {
    fn max_retries(&self) -> usize {
        match self {
            RetryPolicy::Once => 0,
            RetryPolicy::Classified(b) | RetryPolicy::AnyFailure(b) => b.max_retries,
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            RetryPolicy::Once => Duration::ZERO,
            RetryPolicy::Classified(b) | RetryPolicy::AnyFailure(b) => b.delay_for_attempt(attempt),
        }
    }

    fn retries_status(&self, status: StatusCode) -> bool {
        match self {
            RetryPolicy::Once => false,
            RetryPolicy::Classified(_) => classify_status(status) == RetryDisposition::Retryable,
            RetryPolicy::AnyFailure(_) => true,
        }
    }

    fn retries_error(&self, err: &reqwest::Error) -> bool {
        match self {
            RetryPolicy::Once => false,
            RetryPolicy::Classified(_) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            RetryPolicy::AnyFailure(_) => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub browser_headers: bool,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(BROWSER_USER_AGENT.to_string()),
            browser_headers: true,
            global_concurrency: 16,
            per_source_concurrency: 10,
        }
    }
}

/// One outbound GET.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub bearer_token: Option<String>,
    /// Sleep taken after acquiring a concurrency permit, before sending.
    pub polite_delay: Option<Duration>,
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn bearer(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    pub fn polite_delay(mut self, delay: Duration) -> Self {
        self.polite_delay = (!delay.is_zero()).then_some(delay);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limited by {url} (retry after {})", retry_after.as_deref().unwrap_or("unspecified"))]
    RateLimited {
        url: String,
        retry_after: Option<String>,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse a delta-seconds `Retry-After` value.
pub fn retry_after_secs(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
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
        if config.browser_headers {
            let mut headers = HeaderMap::new();
            headers.insert(
                ACCEPT,
                HeaderValue::from_static(
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                ),
            );
            headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
            builder = builder.default_headers(headers);
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &FetchRequest,
        retry: RetryPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url = %request.url);
        self.fetch_inner(source_id, request, retry).instrument(span).await
    }

    async fn fetch_inner(
        &self,
        source_id: &str,
        request: &FetchRequest,
        retry: RetryPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        // Semaphores are never closed, so acquire only fails after shutdown.
        let _global = self.global_limit.acquire().await.ok();
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.ok();

        if let Some(delay) = request.polite_delay {
            tokio::time::sleep(delay).await;
        }

        let max_retries = retry.max_retries();
        let mut attempt = 0usize;
        loop {
            match self.send_once(request).await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if retry.retries_status(status) && attempt < max_retries {
                        let delay = retry.delay_for_attempt(attempt);
                        warn!(status = status.as_u16(), attempt, ?delay, "retrying after http status");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = resp
                            .headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .map(ToString::to_string);
                        return Err(FetchError::RateLimited {
                            url: final_url,
                            retry_after,
                        });
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if retry.retries_error(&err) && attempt < max_retries {
                        let delay = retry.delay_for_attempt(attempt);
                        warn!(error = %err, attempt, ?delay, "retrying after request error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    async fn send_once(&self, request: &FetchRequest) -> Result<reqwest::Response, reqwest::Error> {
        let mut builder = self.client.get(&request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder.send().await
    }

    /// Single-attempt form POST, used for OAuth token exchange.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let resp = self
            .client
            .post(url)
            .header(ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
