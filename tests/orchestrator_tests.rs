use async_trait::async_trait;
use mrm_downloader::bridge::{self, BridgeError, BridgeInstaller, PageSession, RelayRequest, DEFAULT_RELAY_TIMEOUT};
use mrm_downloader::http_client::PageNetwork;
use mrm_downloader::metrics::{DIRECT_PATH, PROXIED_PATH};
use mrm_downloader::orchestrator::{
    DirectFetch, FetchError, FetchOrchestrator, FetchedResponse, ProxyTransport, RetryPolicy,
};
use mrm_downloader::protocol::{Credentials, FetchOptions, ProxyBody, ProxyResponse, RequestInit, RequestMode, ResponseType};
use reqwest::Url;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Proxy that fails its first `failures` calls and then serves `body`.
struct ScriptedProxy {
    failures: u32,
    body: Vec<u8>,
    calls: AtomicU32,
    seen: Mutex<Vec<RelayRequest>>,
}

impl ScriptedProxy {
    fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            body: b"page bytes".to_vec(),
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyTransport for ScriptedProxy {
    async fn proxy_fetch(&self, request: RelayRequest) -> Result<ProxyResponse, BridgeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().unwrap().push(request);
        if call <= self.failures {
            return Ok(ProxyResponse::timeout(format!("mrm_{}", call)));
        }
        Ok(ProxyResponse {
            ok: true,
            status: Some(200),
            status_text: "OK".to_string(),
            headers: vec![("content-type".to_string(), "image/png".to_string())],
            body: Some(ProxyBody::Bytes(self.body.clone())),
            error: None,
            ..ProxyResponse::failure(format!("mrm_{}", call), "")
        })
    }
}

/// Direct path that fails its first `failures` calls and then answers with
/// `status`.
struct ScriptedDirect {
    failures: u32,
    status: u16,
    calls: AtomicU32,
    seen: Mutex<Vec<FetchOptions>>,
}

impl ScriptedDirect {
    fn new(failures: u32, status: u16) -> Arc<Self> {
        Arc::new(Self {
            failures,
            status,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectFetch for ScriptedDirect {
    async fn fetch_direct(
        &self,
        _url: &str,
        options: &FetchOptions,
        _timeout: Duration,
    ) -> Result<FetchedResponse, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().unwrap().push(options.clone());
        if call <= self.failures {
            return Err(FetchError::Network(format!("direct failure {}", call)));
        }
        Ok(FetchedResponse::buffered(self.status, vec![], b"direct bytes".to_vec()))
    }
}

fn orchestrator(proxy: Arc<ScriptedProxy>, direct: Arc<ScriptedDirect>, attempts: u32) -> FetchOrchestrator {
    FetchOrchestrator::new(proxy, direct, RetryPolicy::new(attempts, 1000), Duration::from_secs(30))
}

/// The paused clock only moves by whole timer deadlines.
fn assert_elapsed(start: Instant, expected_ms: u64) {
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(expected_ms) && elapsed < Duration::from_millis(expected_ms + 50),
        "expected ~{}ms, got {:?}",
        expected_ms,
        elapsed
    );
}

fn media_options() -> FetchOptions {
    FetchOptions::get()
        .with_header("Referer", "https://myreadingmanga.info/some-post/")
        .with_header("Accept", "image/*")
}

#[tokio::test(start_paused = true)]
async fn test_proxied_success_never_touches_direct() {
    let proxy = ScriptedProxy::failing(0);
    let direct = ScriptedDirect::new(0, 200);
    let orchestrator = orchestrator(proxy.clone(), direct.clone(), 3);

    let response = orchestrator.fetch("https://cdn.test/1.png", &media_options()).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.content_type(), Some("image/png"));
    assert_eq!(response.bytes().await.unwrap(), b"page bytes".to_vec());
    assert_eq!(proxy.calls(), 1);
    assert_eq!(direct.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_page_receives_only_method_and_referrer() {
    let proxy = ScriptedProxy::failing(0);
    let orchestrator = orchestrator(proxy.clone(), ScriptedDirect::new(0, 200), 3);

    orchestrator.fetch("https://cdn.test/1.png", &media_options()).await.unwrap();

    let seen = proxy.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].want_body);
    assert_eq!(seen[0].response_type, ResponseType::Bytes);
    assert_eq!(seen[0].options.method, "GET");
    assert!(seen[0].options.headers.is_empty());
    assert_eq!(
        seen[0].options.referrer.as_deref(),
        Some("https://myreadingmanga.info/some-post/")
    );
}

#[tokio::test(start_paused = true)]
async fn test_proxied_recovery_skips_fallback() {
    let proxy = ScriptedProxy::failing(2);
    let direct = ScriptedDirect::new(0, 200);
    let orchestrator = orchestrator(proxy.clone(), direct.clone(), 3);

    let start = Instant::now();
    let response = orchestrator.fetch("https://cdn.test/1.png", &media_options()).await.unwrap();

    assert_eq!(response.bytes().await.unwrap(), b"page bytes".to_vec());
    assert_eq!(proxy.calls(), 3);
    assert_eq!(direct.calls(), 0);
    // 1000ms after the first failure, 2000ms after the second.
    assert_elapsed(start, 3000);
}

#[tokio::test(start_paused = true)]
async fn test_proxied_exhaustion_falls_back_with_fresh_budget() {
    let proxy = ScriptedProxy::failing(u32::MAX);
    let direct = ScriptedDirect::new(2, 200);
    let orchestrator = orchestrator(proxy.clone(), direct.clone(), 3);

    let start = Instant::now();
    let response = orchestrator.fetch("https://cdn.test/1.png", &media_options()).await.unwrap();

    assert_eq!(response.bytes().await.unwrap(), b"direct bytes".to_vec());
    assert_eq!(proxy.calls(), 3);
    assert_eq!(direct.calls(), 3);
    // Both paths back off 1000ms then 2000ms.
    assert_elapsed(start, 6000);

    let seen = direct.seen.lock().unwrap();
    assert_eq!(seen[0].credentials, Some(Credentials::Include));
    assert_eq!(seen[0].mode, Some(RequestMode::Cors));
    assert_eq!(seen[0].header("accept"), Some("image/*"));
}

#[tokio::test(start_paused = true)]
async fn test_both_paths_exhausted_reports_direct_error() {
    let proxy = ScriptedProxy::failing(u32::MAX);
    let direct = ScriptedDirect::new(u32::MAX, 200);
    let orchestrator = orchestrator(proxy.clone(), direct.clone(), 2);

    let error = orchestrator
        .fetch("https://cdn.test/1.png", &media_options())
        .await
        .unwrap_err();

    assert_eq!(proxy.calls(), 2);
    assert_eq!(direct.calls(), 2);
    assert_eq!(error.last_error().to_string(), "network error: direct failure 2");
    match &error {
        FetchError::Exhausted { proxied, .. } => assert_eq!(proxied.to_string(), "PAGE_FETCH_TIMEOUT"),
        other => panic!("expected exhaustion, got {:?}", other),
    }
    assert_eq!(orchestrator.metrics().exhausted(), 1);
    assert_eq!(orchestrator.metrics().get_metrics(PROXIED_PATH).unwrap().timeouts, 2);
    assert_eq!(orchestrator.metrics().get_metrics(DIRECT_PATH).unwrap().failures, 2);
}

#[tokio::test(start_paused = true)]
async fn test_direct_http_error_is_returned_without_retry() {
    let proxy = ScriptedProxy::failing(u32::MAX);
    let direct = ScriptedDirect::new(0, 404);
    let orchestrator = orchestrator(proxy, direct.clone(), 3);

    let response = orchestrator.fetch("https://cdn.test/1.png", &media_options()).await.unwrap();

    assert_eq!(response.status, 404);
    assert!(!response.ok());
    assert_eq!(direct.calls(), 1);
}

/// Page network that always answers 200 with a fixed body.
struct StaticPage;

#[async_trait]
impl PageNetwork for StaticPage {
    async fn fetch(&self, _url: &str, _init: &RequestInit) -> Result<FetchedResponse, FetchError> {
        Ok(FetchedResponse::buffered(200, vec![], b"\x89PNG".to_vec()))
    }
}

fn page_url() -> Url {
    Url::parse("https://myreadingmanga.info/some-post/").unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_full_stack_through_the_page() {
    let page = PageSession::new(page_url(), Arc::new(StaticPage));
    let relay = bridge::connect(&page, BridgeInstaller::spawn(), DEFAULT_RELAY_TIMEOUT);
    let direct = ScriptedDirect::new(0, 200);
    let orchestrator = FetchOrchestrator::new(
        Arc::new(relay),
        direct.clone(),
        RetryPolicy::default(),
        Duration::from_secs(30),
    );

    let response = orchestrator.fetch("https://cdn.test/1.png", &media_options()).await.unwrap();

    assert_eq!(response.bytes().await.unwrap(), b"\x89PNG".to_vec());
    assert_eq!(direct.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_full_stack_falls_back_when_page_never_answers() {
    let page = PageSession::with_injection_blocked(page_url(), Arc::new(StaticPage));
    let relay = bridge::connect(&page, BridgeInstaller::spawn(), DEFAULT_RELAY_TIMEOUT);
    let direct = ScriptedDirect::new(0, 200);
    let orchestrator = FetchOrchestrator::new(
        Arc::new(relay),
        direct.clone(),
        RetryPolicy::default(),
        Duration::from_secs(30),
    );

    let start = Instant::now();
    let response = orchestrator.fetch("https://cdn.test/1.png", &media_options()).await.unwrap();

    assert_eq!(response.bytes().await.unwrap(), b"direct bytes".to_vec());
    assert_eq!(direct.calls(), 1);
    // Three relay timeouts plus the 1000ms and 2000ms backoff sleeps.
    assert_elapsed(start, 3 * 8000 + 3000);
}

/// Page network whose API answers with the JSON document `null`.
struct NullJsonPage;

#[async_trait]
impl PageNetwork for NullJsonPage {
    async fn fetch(&self, _url: &str, _init: &RequestInit) -> Result<FetchedResponse, FetchError> {
        let headers = vec![("content-type".to_string(), "application/json".to_string())];
        Ok(FetchedResponse::buffered(200, headers, b"null".to_vec()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_json_null_body_arrives_as_null() {
    let page = PageSession::new(page_url(), Arc::new(NullJsonPage));
    let relay = bridge::connect(&page, BridgeInstaller::spawn(), DEFAULT_RELAY_TIMEOUT);
    let direct = ScriptedDirect::new(0, 200);
    let orchestrator = FetchOrchestrator::new(
        Arc::new(relay),
        direct.clone(),
        RetryPolicy::default(),
        Duration::from_secs(30),
    );

    let response = orchestrator
        .fetch_as("https://myreadingmanga.info/api/bookmark.json", &FetchOptions::get(), ResponseType::Json)
        .await
        .unwrap();

    assert_eq!(response.content_type(), Some("application/json"));
    assert_eq!(response.json().await.unwrap(), serde_json::Value::Null);
    assert_eq!(direct.calls(), 0);
}
