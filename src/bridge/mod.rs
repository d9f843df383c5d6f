//! Cross-context fetch bridge
//!
//! Requests issued by the controller are proxied through the hosted page's own
//! execution context so that cookies, Referer and CORS behave exactly as they
//! would for a request the page made itself. Three isolated contexts take part,
//! each running as its own task and talking only through channels:
//!
//! - the page context ([`PageSession`]), whose window bus is shared with
//!   everything else the page posts, and where the [`page_fetch`] bridge runs;
//! - the background context ([`BridgeInstaller`]), which injects the bridge
//!   into a page at most once per page lifetime;
//! - the content context ([`ContentRelay`]), which turns a relay request into a
//!   window message and waits for the correlated answer or a timeout.
//!
//! # Example
//!
//! ```no_run
//! use mrm_downloader::bridge::{self, BridgeInstaller, PageSession, RelayRequest};
//! use mrm_downloader::http_client::{EnhancedHttpClient, HttpClientConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let page_url = reqwest::Url::parse("https://myreadingmanga.info/some-post/")?;
//! let network = EnhancedHttpClient::for_page(HttpClientConfig::default(), &page_url, &[])?;
//! let page = PageSession::new(page_url, Arc::new(network));
//!
//! let installer = BridgeInstaller::spawn();
//! let relay = bridge::connect(&page, installer, Duration::from_millis(8000));
//!
//! let response = relay
//!     .send(RelayRequest::bytes("https://myreadingmanga.info/wp-content/uploads/1.jpg"))
//!     .await?;
//! println!("ok={} status={:?}", response.ok, response.status);
//! # Ok(())
//! # }
//! ```

pub mod installer;
pub mod page_fetch;
pub mod relay;
pub mod window;

pub use installer::{BridgeInstaller, InstallationState, InstallerHandle};
pub use relay::{ContentRelay, RelayHandle, RelayRequest};
pub use window::{PageId, PageSession, PageWindow, WindowListener};

use std::time::Duration;

/// Default ceiling on how long the relay waits for the page to answer
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_millis(8000);

/// Errors raised by the message plumbing between contexts
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Bridge installer is not running")]
    InstallerUnavailable,

    #[error("Content relay is not running")]
    RelayUnavailable,

    #[error("Content relay dropped the request before answering")]
    RelayDropped,
}

/// Start a content relay for `page` and return the handle the controller
/// talks to.
pub fn connect(page: &PageSession, installer: InstallerHandle, timeout: Duration) -> RelayHandle {
    ContentRelay::new(page.clone(), installer, timeout).spawn()
}
