//! Application state for the downloader
//!
//! Owns the long-lived pieces (settings, the background bridge installer, the
//! controller's direct HTTP client, metrics) and wires a fresh set of
//! per-page contexts every time a post page is opened.
//!
//! # Structure
//!
//! - `AppState`: shared state, built once from `Settings`
//! - `OpenPage`: one loaded post page with its relay and orchestrator

use crate::bridge::{self, BridgeInstaller, InstallerHandle, PageSession};
use crate::config::Settings;
use crate::http_client::{EnhancedHttpClient, FetchError, HttpClientConfig};
use crate::metrics::MetricsTracker;
use crate::orchestrator::FetchOrchestrator;
use reqwest::Url;
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    /// User settings
    pub settings: Settings,
    /// Background-context installer shared by every page
    pub installer: InstallerHandle,
    /// Controller-context client, used for post HTML and the fallback path
    pub direct_client: Arc<EnhancedHttpClient>,
    /// Per-path fetch metrics
    pub metrics: Arc<MetricsTracker>,
}

/// A post page opened in its own page context
pub struct OpenPage {
    pub session: PageSession,
    pub orchestrator: Arc<FetchOrchestrator>,
}

impl AppState {
    /// Must be called inside a Tokio runtime, the installer runs as a task.
    pub fn new(settings: Settings) -> Result<Self, FetchError> {
        let direct_client = EnhancedHttpClient::with_config(Self::http_config(&settings))?;
        Ok(Self {
            installer: BridgeInstaller::spawn(),
            direct_client: Arc::new(direct_client),
            metrics: Arc::new(MetricsTracker::new()),
            settings,
        })
    }

    fn http_config(settings: &Settings) -> HttpClientConfig {
        HttpClientConfig {
            timeout: settings.direct_timeout(),
            max_retries: settings.retry_count as usize,
            ..HttpClientConfig::default()
        }
    }

    /// Create the page context for `page_url` with the configured cookies and
    /// a relay in front of it.
    pub fn open_page(&self, page_url: &Url) -> Result<OpenPage, FetchError> {
        let cookies = self.settings.page_cookies(page_url.host_str().unwrap_or_default());
        log::debug!("Opening {} with {} cookies", page_url, cookies.len());

        let network = EnhancedHttpClient::for_page(Self::http_config(&self.settings), page_url, &cookies)?;
        let session = PageSession::new(page_url.clone(), Arc::new(network));
        let relay = bridge::connect(&session, self.installer.clone(), self.settings.relay_timeout());

        let orchestrator = FetchOrchestrator::new(
            Arc::new(relay),
            self.direct_client.clone(),
            self.settings.retry_policy(),
            self.settings.direct_timeout(),
        )
        .with_metrics(self.metrics.clone());

        Ok(OpenPage {
            session,
            orchestrator: Arc::new(orchestrator),
        })
    }
}
