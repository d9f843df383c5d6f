use crate::http_client::PageNetwork;
use reqwest::Url;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

static NEXT_PAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one page lifetime. A reload or navigation gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(u64);

impl PageId {
    fn next() -> Self {
        PageId(NEXT_PAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page#{}", self.0)
    }
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<Value>>,
}

type Registry = Mutex<Listeners>;

fn lock(registry: &Registry) -> MutexGuard<'_, Listeners> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The page's window message bus. Every listener sees every message posted
/// after it subscribed, whoever posted it, in posting order. Nothing is ever
/// dropped for a slow listener.
#[derive(Clone, Default)]
pub struct PageWindow {
    registry: Arc<Registry>,
}

impl PageWindow {
    fn new() -> Self {
        Self::default()
    }

    /// Fire and forget, like `window.postMessage`.
    pub fn post_message(&self, message: Value) {
        let mut listeners = lock(&self.registry);
        listeners
            .senders
            .retain(|_, tx| tx.send(message.clone()).is_ok());
    }

    pub fn subscribe(&self) -> WindowListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = lock(&self.registry);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.senders.insert(id, tx);
        WindowListener {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Number of listeners currently registered on the window
    pub fn listener_count(&self) -> usize {
        lock(&self.registry).senders.len()
    }
}

/// A registered window listener. Dropping it removes the listener.
pub struct WindowListener {
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
    registry: Weak<Registry>,
}

impl WindowListener {
    /// Next message on the window, or `None` once the window is gone.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl Drop for WindowListener {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).senders.remove(&self.id);
        }
    }
}

struct PageInner {
    id: PageId,
    url: Url,
    window: PageWindow,
    network: Arc<dyn PageNetwork>,
    allows_injection: bool,
    closed: CancellationToken,
}

impl Drop for PageInner {
    // The last handle going away ends the page lifetime too.
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Handle on one loaded page: its window, its network identity and its
/// lifetime.
#[derive(Clone)]
pub struct PageSession {
    inner: Arc<PageInner>,
}

impl PageSession {
    pub fn new(url: Url, network: Arc<dyn PageNetwork>) -> Self {
        Self::build(url, network, true)
    }

    /// A page whose security policy rejects injected scripts, so the bridge
    /// can never be installed.
    pub fn with_injection_blocked(url: Url, network: Arc<dyn PageNetwork>) -> Self {
        Self::build(url, network, false)
    }

    fn build(url: Url, network: Arc<dyn PageNetwork>, allows_injection: bool) -> Self {
        Self {
            inner: Arc::new(PageInner {
                id: PageId::next(),
                url,
                window: PageWindow::new(),
                network,
                allows_injection,
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> PageId {
        self.inner.id
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn window(&self) -> &PageWindow {
        &self.inner.window
    }

    pub fn network(&self) -> Arc<dyn PageNetwork> {
        self.inner.network.clone()
    }

    pub fn allows_injection(&self) -> bool {
        self.inner.allows_injection
    }

    /// Unload the page. Scripts running in it stop.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }
}

impl fmt::Debug for PageSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageSession")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url.as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{FetchError, FetchedResponse};
    use crate::protocol::RequestInit;
    use async_trait::async_trait;
    use serde_json::json;

    struct Offline;

    #[async_trait]
    impl PageNetwork for Offline {
        async fn fetch(&self, _url: &str, _init: &RequestInit) -> Result<FetchedResponse, FetchError> {
            Err(FetchError::Network("offline".to_string()))
        }
    }

    fn page() -> PageSession {
        PageSession::new(Url::parse("https://example.com/post/").unwrap(), Arc::new(Offline))
    }

    #[tokio::test]
    async fn test_every_listener_sees_posted_messages() {
        let page = page();
        let mut a = page.window().subscribe();
        let mut b = page.window().subscribe();
        page.window().post_message(json!({"hello": 1}));

        assert_eq!(a.next().await.unwrap(), json!({"hello": 1}));
        assert_eq!(b.next().await.unwrap(), json!({"hello": 1}));
    }

    #[tokio::test]
    async fn test_dropping_listener_deregisters_it() {
        let page = page();
        let listener = page.window().subscribe();
        assert_eq!(page.window().listener_count(), 1);
        drop(listener);
        assert_eq!(page.window().listener_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_listener_loses_nothing() {
        let page = page();
        let mut slow = page.window().subscribe();
        for i in 0..5000 {
            page.window().post_message(json!({ "n": i }));
        }
        for i in 0..5000 {
            assert_eq!(slow.next().await.unwrap(), json!({ "n": i }));
        }
    }

    #[tokio::test]
    async fn test_listener_ends_when_window_is_gone() {
        let window = PageWindow::new();
        let mut listener = window.subscribe();
        window.post_message(json!(1));
        drop(window);

        assert_eq!(listener.next().await, Some(json!(1)));
        assert_eq!(listener.next().await, None);
    }

    #[test]
    fn test_page_ids_are_distinct() {
        assert_ne!(page().id(), page().id());
    }

    #[test]
    fn test_close_marks_page_closed() {
        let page = page();
        assert!(!page.is_closed());
        page.close();
        assert!(page.is_closed());
    }
}
