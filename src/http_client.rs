use crate::config::CookieEntry;
use crate::protocol::{CacheMode, Credentials, FetchOptions, RequestInit, RequestMode};
use async_trait::async_trait;
use rand::Rng;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, ClientBuilder, Method, StatusCode, Url};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// User agents to rotate through to avoid bot detection
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Errors produced by either transport path
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP error: {status} {status_text}")]
    Http { status: u16, status_text: String },

    /// Failure reported by the page context, e.g. `PAGE_FETCH_TIMEOUT`
    #[error("{0}")]
    Page(String),

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("all attempts failed (proxied: {proxied}; direct: {direct})")]
    Exhausted {
        proxied: Box<FetchError>,
        direct: Box<FetchError>,
    },
}

impl FetchError {
    /// The most recent error observed before giving up.
    pub fn last_error(&self) -> &FetchError {
        match self {
            FetchError::Exhausted { direct, .. } => direct,
            other => other,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_builder() {
            FetchError::InvalidRequest(e.to_string())
        } else if e.is_body() || e.is_decode() {
            FetchError::Body(e.to_string())
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

enum ResponseBody {
    Buffered(Vec<u8>),
    Streaming(reqwest::Response),
    Broken(String),
}

/// A response whose body has not necessarily been read yet.
pub struct FetchedResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    body: ResponseBody,
}

impl std::fmt::Debug for FetchedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl FetchedResponse {
    /// A response whose body is already in memory
    pub fn buffered(status: u16, headers: Vec<(String, String)>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            status_text: reason_phrase(status),
            headers,
            body: ResponseBody::Buffered(body.into()),
        }
    }

    /// A response whose body read fails with `error`
    pub fn with_broken_body(status: u16, headers: Vec<(String, String)>, error: &str) -> Self {
        Self {
            status,
            status_text: reason_phrase(status),
            headers,
            body: ResponseBody::Broken(error.to_string()),
        }
    }

    pub fn from_reqwest(response: reqwest::Response) -> Self {
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        Self {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: ResponseBody::Streaming(response),
        }
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// MIME type without parameters, if the server sent one
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .and_then(|ct| ct.split(';').next())
            .map(str::trim)
            .filter(|ct| !ct.is_empty())
    }

    pub async fn bytes(self) -> Result<Vec<u8>, FetchError> {
        match self.body {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Streaming(response) => Ok(response.bytes().await?.to_vec()),
            ResponseBody::Broken(error) => Err(FetchError::Body(error)),
        }
    }

    pub async fn text(self) -> Result<String, FetchError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json(self) -> Result<Value, FetchError> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Body(e.to_string()))
    }
}

fn reason_phrase(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or_default()
        .to_string()
}

/// The network stack of a page context: requests carry the page's cookies,
/// referrer and origin.
#[async_trait]
pub trait PageNetwork: Send + Sync {
    async fn fetch(&self, url: &str, init: &RequestInit) -> Result<FetchedResponse, FetchError>;
}

/// Plain requests made from the controller's own context.
#[async_trait]
pub trait DirectFetch: Send + Sync {
    async fn fetch_direct(
        &self,
        url: &str,
        options: &FetchOptions,
        timeout: Duration,
    ) -> Result<FetchedResponse, FetchError>;
}

/// Configuration for the HTTP client
#[derive(Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub max_retries: usize,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub enable_cookies: bool,
    pub enable_gzip: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_retry_delay_ms: 500,
            max_retry_delay_ms: 8000,
            enable_cookies: true,
            enable_gzip: true,
        }
    }
}

/// Identity a page context carries into its requests
struct PageIdentity {
    page_url: Url,
    jar: Arc<Jar>,
}

/// HTTP client with browser-like defaults.
///
/// Built with [`EnhancedHttpClient::with_config`] it is the controller's direct
/// client. Built with [`EnhancedHttpClient::for_page`] it plays the network
/// stack of a page: cookies come from the page's jar and every request carries
/// the page as referrer and origin.
pub struct EnhancedHttpClient {
    client: Client,
    config: HttpClientConfig,
    identity: Option<PageIdentity>,
}

impl EnhancedHttpClient {
    /// Create a new HTTP client with default configuration
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_config(HttpClientConfig::default())
    }

    /// Create a new HTTP client with custom configuration
    pub fn with_config(config: HttpClientConfig) -> Result<Self, reqwest::Error> {
        let client = Self::builder(&config)
            .cookie_store(config.enable_cookies)
            .build()?;

        Ok(Self {
            client,
            config,
            identity: None,
        })
    }

    /// Create the network stack for the page at `page_url`, seeded with
    /// `cookies` (`name=value` pairs).
    pub fn for_page(
        config: HttpClientConfig,
        page_url: &Url,
        cookies: &[CookieEntry],
    ) -> Result<Self, reqwest::Error> {
        let jar = Arc::new(Jar::default());
        for cookie in cookies {
            jar.add_cookie_str(&cookie.set_cookie_string(), page_url);
        }

        // Cookies are attached per request according to the credentials mode,
        // so the client itself must not manage them.
        let client = Self::builder(&config).build()?;

        Ok(Self {
            client,
            config,
            identity: Some(PageIdentity {
                page_url: page_url.clone(),
                jar,
            }),
        })
    }

    fn builder(config: &HttpClientConfig) -> ClientBuilder {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Accept",
            HeaderValue::from_static("image/avif,image/webp,image/apng,*/*;q=0.8"),
        );
        headers.insert("Accept-Language", HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert("DNT", HeaderValue::from_static("1"));

        ClientBuilder::new()
            .timeout(config.timeout)
            .user_agent(Self::random_user_agent())
            .gzip(config.enable_gzip)
            .brotli(config.enable_gzip)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .default_headers(headers)
    }

    /// Get a random user agent from the pool
    fn random_user_agent() -> &'static str {
        let mut rng = rand::thread_rng();
        let index = rng.gen_range(0..USER_AGENTS.len());
        USER_AGENTS[index]
    }

    /// Calculate retry delay with exponential backoff and jitter
    fn calculate_retry_delay(&self, attempt: usize) -> Duration {
        let base_delay = self.config.initial_retry_delay_ms;
        let max_delay = self.config.max_retry_delay_ms;

        let delay_ms = base_delay
            .saturating_mul(2u64.saturating_pow(attempt as u32))
            .min(max_delay);

        // ±25% jitter
        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0.75..=1.25);
        Duration::from_millis((delay_ms as f64 * jitter) as u64)
    }

    /// Check if a status code is retryable
    fn is_retryable_status(status: StatusCode) -> bool {
        matches!(
            status.as_u16(),
            // Rate limiting
            429 |
            // Server errors
            500 | 502 | 503 | 504 |
            // Cloudflare errors
            520 | 521 | 522 | 523 | 524 | 525 | 526 | 527
        )
    }

    /// GET a page with retry logic. Used for the post HTML itself, which is
    /// fetched before any page context exists.
    pub async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            let request = self
                .client
                .get(url)
                .header("User-Agent", Self::random_user_agent());

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if Self::is_retryable_status(status) && attempt < self.config.max_retries {
                        log::warn!(
                            "Received retryable status {} for {}, attempt {}/{}",
                            status,
                            url,
                            attempt + 1,
                            self.config.max_retries + 1
                        );
                        sleep(self.calculate_retry_delay(attempt)).await;
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) => {
                    let should_retry = e.is_timeout() || e.is_connect() || e.is_request();
                    if should_retry && attempt < self.config.max_retries {
                        log::warn!(
                            "Request failed for {}, attempt {}/{}: {}",
                            url,
                            attempt + 1,
                            self.config.max_retries + 1,
                            e
                        );
                        sleep(self.calculate_retry_delay(attempt)).await;
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }

        Err(last_error
            .map(FetchError::from)
            .unwrap_or_else(|| FetchError::Network(format!("no attempts made for {}", url))))
    }

    /// Fetch a URL and return the response text
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.get_with_retry(url).await?;
        if !response.status().is_success() {
            return Err(FetchError::Http {
                status: response.status().as_u16(),
                status_text: response.status().canonical_reason().unwrap_or_default().to_string(),
            });
        }
        Ok(response.text().await?)
    }

    /// Get the underlying reqwest client for direct access
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn parse_method(method: &str) -> Result<Method, FetchError> {
        Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| FetchError::InvalidRequest(format!("invalid method {:?}", method)))
    }

    fn parse_headers(headers: &std::collections::BTreeMap<String, String>) -> Result<HeaderMap, FetchError> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
            map.insert(name, value);
        }
        Ok(map)
    }

    /// Headers a browser would add for a fetch issued by the page at `identity`.
    fn page_headers(identity: &PageIdentity, target: &Url, init: &RequestInit) -> HeaderMap {
        let same_origin = target.origin() == identity.page_url.origin();
        let mut headers = HeaderMap::new();

        let send_cookies = match init.credentials {
            Credentials::Include => true,
            Credentials::SameOrigin => same_origin,
            Credentials::Omit => false,
        };
        if send_cookies {
            if let Some(cookie) = identity.jar.cookies(target) {
                headers.insert(reqwest::header::COOKIE, cookie);
            }
        }

        let referrer = init
            .referrer
            .clone()
            .unwrap_or_else(|| identity.page_url.to_string());
        if let Ok(value) = HeaderValue::from_str(&referrer) {
            headers.insert(reqwest::header::REFERER, value);
        }

        if init.mode == RequestMode::Cors && !same_origin {
            if let Ok(value) = HeaderValue::from_str(&identity.page_url.origin().ascii_serialization()) {
                headers.insert(reqwest::header::ORIGIN, value);
            }
        }

        let fetch_mode = match init.mode {
            RequestMode::Cors => "cors",
            RequestMode::NoCors => "no-cors",
            RequestMode::SameOrigin => "same-origin",
        };
        headers.insert("Sec-Fetch-Mode", HeaderValue::from_static(fetch_mode));
        headers.insert(
            "Sec-Fetch-Site",
            HeaderValue::from_static(if same_origin { "same-origin" } else { "cross-site" }),
        );

        if matches!(init.cache, CacheMode::NoStore | CacheMode::Reload | CacheMode::NoCache) {
            headers.insert(reqwest::header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(reqwest::header::PRAGMA, HeaderValue::from_static("no-cache"));
        }

        headers
    }
}

#[async_trait]
impl PageNetwork for EnhancedHttpClient {
    async fn fetch(&self, url: &str, init: &RequestInit) -> Result<FetchedResponse, FetchError> {
        let target = Url::parse(url).map_err(|e| FetchError::InvalidRequest(format!("{}: {}", url, e)))?;
        let method = Self::parse_method(&init.method)?;

        let mut headers = match &self.identity {
            Some(identity) => Self::page_headers(identity, &target, init),
            None => HeaderMap::new(),
        };
        headers.extend(Self::parse_headers(&init.headers)?);

        log::debug!("Page fetch {} {}", method, target);
        let response = self.client.request(method, target).headers(headers).send().await?;
        Ok(FetchedResponse::from_reqwest(response))
    }
}

#[async_trait]
impl DirectFetch for EnhancedHttpClient {
    async fn fetch_direct(
        &self,
        url: &str,
        options: &FetchOptions,
        timeout: Duration,
    ) -> Result<FetchedResponse, FetchError> {
        let method = Self::parse_method(&options.method)?;
        let mut headers = Self::parse_headers(&options.headers)?;
        if let Some(referrer) = &options.referrer {
            if let Ok(value) = HeaderValue::from_str(referrer) {
                headers.insert(reqwest::header::REFERER, value);
            }
        }

        log::debug!("Direct fetch {} {}", method, url);
        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .timeout(timeout)
            .send()
            .await?;
        Ok(FetchedResponse::from_reqwest(response))
    }
}
