//! Authenticated fetches with two independent transport paths.
//!
//! The proxied path goes through the page context and inherits the site's
//! cookies and referrer. When every proxied attempt fails, the same request is
//! retried directly from this context. Each path has its own attempt budget
//! and exponential backoff; only the exhaustion of both reaches the caller.

use crate::bridge::{BridgeError, RelayHandle, RelayRequest};
use crate::metrics::{MetricsTracker, DIRECT_PATH, PROXIED_PATH};
use crate::protocol::{Credentials, FetchOptions, ProxyBody, ProxyResponse, RequestMode, ResponseType};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use crate::http_client::{DirectFetch, FetchError, FetchedResponse};

/// Anything that can carry a request through the page context.
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    async fn proxy_fetch(&self, request: RelayRequest) -> Result<ProxyResponse, BridgeError>;
}

#[async_trait]
impl ProxyTransport for RelayHandle {
    async fn proxy_fetch(&self, request: RelayRequest) -> Result<ProxyResponse, BridgeError> {
        self.send(request).await
    }
}

impl From<BridgeError> for FetchError {
    fn from(e: BridgeError) -> Self {
        FetchError::Page(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base_ms,
        }
    }

    /// Wait between attempt `attempt` and the next: `base * 2^(attempt-1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 1000)
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping with exponential
/// backoff between failures. Returns the first success or the last error.
pub async fn try_with_retries<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                log::warn!("{} attempt {}/{} failed: {}", label, attempt, attempts, e);
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| FetchError::Network(format!("{}: no attempts made", label))))
}

/// Turn a failed relay answer into a typed error.
fn proxy_failure(response: ProxyResponse) -> FetchError {
    match response.status {
        Some(status) => FetchError::Http {
            status,
            status_text: response.status_text,
        },
        None => FetchError::Page(response.error.unwrap_or_else(|| "Request failed".to_string())),
    }
}

/// Rebuild a response-like object from what the page sent back.
fn reconstruct(response: ProxyResponse) -> FetchedResponse {
    let status = response.status.unwrap_or(200);
    let is_json = matches!(response.body, Some(ProxyBody::Json(_)));
    let body = response.body.map(ProxyBody::into_bytes).unwrap_or_default();

    let mut fetched = FetchedResponse::buffered(status, response.headers, body);
    fetched.status_text = response.status_text;
    if is_json {
        fetched.set_header("content-type", "application/json");
    }
    fetched
}

/// Public entry point for every download routine.
pub struct FetchOrchestrator {
    proxy: Arc<dyn ProxyTransport>,
    direct: Arc<dyn DirectFetch>,
    policy: RetryPolicy,
    direct_timeout: Duration,
    metrics: Arc<MetricsTracker>,
}

impl FetchOrchestrator {
    pub fn new(
        proxy: Arc<dyn ProxyTransport>,
        direct: Arc<dyn DirectFetch>,
        policy: RetryPolicy,
        direct_timeout: Duration,
    ) -> Self {
        Self {
            proxy,
            direct,
            policy,
            direct_timeout,
            metrics: Arc::new(MetricsTracker::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsTracker>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsTracker> {
        &self.metrics
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch `url` as raw bytes.
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchedResponse, FetchError> {
        self.fetch_as(url, options, ResponseType::Bytes).await
    }

    /// Fetch `url`, asking the page to hand the body back as `response_type`.
    pub async fn fetch_as(
        &self,
        url: &str,
        options: &FetchOptions,
        response_type: ResponseType,
    ) -> Result<FetchedResponse, FetchError> {
        let proxied_error = match self.fetch_proxied(url, options, response_type).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        log::info!("Proxied fetch of {} exhausted, falling back to direct fetch", url);

        match self.fetch_direct(url, options).await {
            Ok(response) => Ok(response),
            Err(direct_error) => {
                self.metrics.record_exhausted();
                Err(FetchError::Exhausted {
                    proxied: Box::new(proxied_error),
                    direct: Box::new(direct_error),
                })
            }
        }
    }

    async fn fetch_proxied(
        &self,
        url: &str,
        options: &FetchOptions,
        response_type: ResponseType,
    ) -> Result<FetchedResponse, FetchError> {
        let page_options = options.for_page_context();

        try_with_retries(&self.policy, "Proxied fetch", |_| {
            let request = RelayRequest {
                url: url.to_string(),
                options: page_options.clone(),
                want_body: true,
                response_type,
            };
            async move {
                let start = Instant::now();
                let response = self.proxy.proxy_fetch(request).await;
                let outcome = match response {
                    Err(e) => Err(FetchError::from(e)),
                    Ok(response) if response.ok => Ok(reconstruct(response)),
                    Ok(response) => {
                        if response.is_timeout() {
                            self.metrics.record_timeout(PROXIED_PATH);
                        }
                        Err(proxy_failure(response))
                    }
                };
                self.metrics.record(PROXIED_PATH, start.elapsed(), outcome.as_ref().err());
                outcome
            }
        })
        .await
    }

    /// The fallback carries no page cookies or referrer of the site session,
    /// and any HTTP response counts as success; only transport errors retry.
    async fn fetch_direct(&self, url: &str, options: &FetchOptions) -> Result<FetchedResponse, FetchError> {
        let direct_options = FetchOptions {
            credentials: Some(Credentials::Include),
            mode: Some(RequestMode::Cors),
            ..options.clone()
        };

        try_with_retries(&self.policy, "Direct fetch", |_| {
            let direct_options = &direct_options;
            async move {
                let start = Instant::now();
                let outcome = self
                    .direct
                    .fetch_direct(url, direct_options, self.direct_timeout)
                    .await;
                self.metrics.record(DIRECT_PATH, start.elapsed(), outcome.as_ref().err());
                outcome
            }
        })
        .await
    }
}
