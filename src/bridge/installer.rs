use super::page_fetch;
use super::window::{PageId, PageSession};
use super::BridgeError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};

/// Which pages already have a fetch bridge. A page is added at most once per
/// lifetime; a second bridge would double every response. Entries are
/// released when the page closes.
#[derive(Debug, Default)]
pub struct InstallationState {
    installed: Mutex<HashSet<PageId>>,
}

impl InstallationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get-or-set: returns true only for the call that marks `page` installed.
    pub fn claim(&self, page: PageId) -> bool {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(page)
    }

    pub fn release(&self, page: PageId) -> bool {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&page)
    }

    pub fn is_installed(&self, page: PageId) -> bool {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&page)
    }

    pub fn len(&self) -> usize {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct InstallCommand {
    page: PageSession,
    reply: oneshot::Sender<()>,
}

/// Background-context service that injects the page fetch bridge.
pub struct BridgeInstaller {
    state: Arc<InstallationState>,
}

impl BridgeInstaller {
    /// Run the installer as its own task.
    pub fn spawn() -> InstallerHandle {
        let (tx, mut rx) = mpsc::channel::<InstallCommand>(32);
        let state = Arc::new(InstallationState::new());
        let installer = BridgeInstaller { state: state.clone() };

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                installer.install(&command.page);
                // Resolve whether or not the bridge actually came up; a page
                // without a bridge shows up later as a relay timeout.
                let _ = command.reply.send(());
            }
            log::debug!("Bridge installer stopped");
        });

        InstallerHandle { tx, state }
    }

    fn install(&self, page: &PageSession) {
        if page.is_closed() {
            log::debug!("Skipping bridge install on closed {}", page.id());
            return;
        }
        if !page.allows_injection() {
            log::warn!("{} rejected script injection, page fetch bridge not installed", page.id());
            return;
        }
        if !self.state.claim(page.id()) {
            log::debug!("Page fetch bridge already installed on {}", page.id());
            return;
        }

        // Subscribe before replying so a request posted right after
        // installation is never missed.
        let listener = page.window().subscribe();
        page_fetch::run(page, listener);
        log::info!("Installed page fetch bridge on {} ({})", page.id(), page.url());

        let (id, closed, state) = (page.id(), page.closed_token(), self.state.clone());
        tokio::spawn(async move {
            closed.cancelled().await;
            state.release(id);
            log::debug!("Released page fetch bridge record for closed {}", id);
        });
    }
}

/// Handle used by content relays to reach the installer.
#[derive(Clone)]
pub struct InstallerHandle {
    tx: mpsc::Sender<InstallCommand>,
    state: Arc<InstallationState>,
}

impl InstallerHandle {
    /// Completes once installation on `page` is confirmed or was attempted.
    pub async fn ensure_installed(&self, page: &PageSession) -> Result<(), BridgeError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(InstallCommand {
                page: page.clone(),
                reply,
            })
            .await
            .map_err(|_| BridgeError::InstallerUnavailable)?;
        done.await.map_err(|_| BridgeError::InstallerUnavailable)
    }

    /// Pages currently holding a bridge.
    pub fn installed_pages(&self) -> usize {
        self.state.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{FetchError, FetchedResponse, PageNetwork};
    use crate::protocol::RequestInit;
    use async_trait::async_trait;
    use reqwest::Url;
    use std::sync::Arc;

    struct Empty;

    #[async_trait]
    impl PageNetwork for Empty {
        async fn fetch(&self, _url: &str, _init: &RequestInit) -> Result<FetchedResponse, FetchError> {
            Ok(FetchedResponse::buffered(204, vec![], Vec::new()))
        }
    }

    fn page_url() -> Url {
        Url::parse("https://myreadingmanga.info/post/").unwrap()
    }

    #[test]
    fn test_claim_is_get_or_set() {
        let state = InstallationState::new();
        let page = PageSession::new(page_url(), Arc::new(Empty));
        assert!(!state.is_installed(page.id()));
        assert!(state.claim(page.id()));
        assert!(!state.claim(page.id()));
        assert!(state.is_installed(page.id()));

        assert!(state.release(page.id()));
        assert!(!state.release(page.id()));
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_installs_one_listener_per_page() {
        let installer = BridgeInstaller::spawn();
        let page = PageSession::new(page_url(), Arc::new(Empty));

        installer.ensure_installed(&page).await.unwrap();
        installer.ensure_installed(&page).await.unwrap();
        assert_eq!(page.window().listener_count(), 1);

        // A reload is a new page and gets its own bridge.
        let reloaded = PageSession::new(page_url(), Arc::new(Empty));
        installer.ensure_installed(&reloaded).await.unwrap();
        assert_eq!(reloaded.window().listener_count(), 1);
    }

    #[tokio::test]
    async fn test_closing_pages_releases_their_record() {
        let installer = BridgeInstaller::spawn();
        let pages: Vec<_> = (0..20).map(|_| PageSession::new(page_url(), Arc::new(Empty))).collect();
        for page in &pages {
            installer.ensure_installed(page).await.unwrap();
        }
        assert_eq!(installer.installed_pages(), 20);

        for page in &pages {
            page.close();
        }
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while installer.installed_pages() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("records of closed pages were never released");

        // A closed page is never reinstalled.
        installer.ensure_installed(&pages[0]).await.unwrap();
        assert_eq!(installer.installed_pages(), 0);
    }

    #[tokio::test]
    async fn test_blocked_injection_still_resolves() {
        let installer = BridgeInstaller::spawn();
        let page = PageSession::with_injection_blocked(page_url(), Arc::new(Empty));

        installer.ensure_installed(&page).await.unwrap();
        assert_eq!(page.window().listener_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_installs_race_to_one_bridge() {
        let installer = BridgeInstaller::spawn();
        let page = PageSession::new(page_url(), Arc::new(Empty));

        let (a, b, c) = tokio::join!(
            installer.ensure_installed(&page),
            installer.ensure_installed(&page),
            installer.ensure_installed(&page),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(page.window().listener_count(), 1);
    }
}
