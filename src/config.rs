use crate::orchestrator::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Where page cookies come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CookieSource {
    /// Cookies picked up from the browser session
    #[default]
    Auto,
    /// Cookies entered by hand
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CookieEntry {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl CookieEntry {
    /// `Set-Cookie` form, so the jar scopes the cookie by path and domain.
    pub fn set_cookie_string(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        let mut cookie = format!("{}={}; Path={}", self.name, self.value, path);
        if !self.domain.is_empty() {
            cookie.push_str("; Domain=");
            cookie.push_str(&self.domain);
        }
        cookie
    }
}

/// User settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Send site cookies with page fetches
    #[serde(default = "default_true")]
    pub use_cookies: bool,

    /// Attempts per transport path
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Timeout for direct requests in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub debug_mode: bool,

    #[serde(default)]
    pub cookie_source: CookieSource,

    /// Custom cookies, used when `cookie_source = "custom"`
    #[serde(default)]
    pub cookies: Vec<CookieEntry>,

    /// Cookies picked up from the browser, used when `cookie_source = "auto"`
    #[serde(default)]
    pub auto_retrieved_cookies: Vec<CookieEntry>,

    /// First backoff delay; doubles with every failed attempt
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// How long the relay waits for the page to answer
    #[serde(default = "default_relay_timeout")]
    pub relay_timeout_ms: u64,

    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    #[serde(default = "default_history_file")]
    pub history_file: String,
}

fn default_true() -> bool { true }
fn default_retry_count() -> u32 { 3 }
fn default_timeout() -> u64 { 30 }
fn default_backoff_base() -> u64 { 1000 }
fn default_relay_timeout() -> u64 { 8000 }
fn default_download_dir() -> String { "downloads".to_string() }
fn default_history_file() -> String { "mrm_history.json".to_string() }

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_cookies: true,
            retry_count: 3,
            timeout_secs: 30,
            debug_mode: false,
            cookie_source: CookieSource::Auto,
            cookies: Vec::new(),
            auto_retrieved_cookies: Vec::new(),
            backoff_base_ms: 1000,
            relay_timeout_ms: 8000,
            download_dir: default_download_dir(),
            history_file: default_history_file(),
        }
    }
}

impl Settings {
    /// Load `config.toml` from the working directory, or defaults.
    pub fn load() -> Self {
        let path = Path::new("config.toml");
        if path.exists() {
            match Self::load_from(path) {
                Ok(settings) => return settings,
                Err(e) => log::warn!("{}, using defaults", e),
            }
        }
        Self::default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(settings.clamped())
    }

    /// Keep values inside the ranges the settings page allows.
    pub fn clamped(mut self) -> Self {
        self.retry_count = self.retry_count.clamp(1, 10);
        self.timeout_secs = self.timeout_secs.clamp(5, 120);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, self.backoff_base_ms)
    }

    pub fn direct_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }

    /// Cookies to seed into the page context for `host`.
    pub fn page_cookies(&self, host: &str) -> Vec<CookieEntry> {
        if !self.use_cookies {
            return Vec::new();
        }
        let source = match self.cookie_source {
            CookieSource::Custom => &self.cookies,
            CookieSource::Auto => &self.auto_retrieved_cookies,
        };
        source
            .iter()
            .filter(|c| domain_matches(&c.domain, host))
            .cloned()
            .collect()
    }
}

/// An empty domain matches any host; `.example.com` matches subdomains too.
fn domain_matches(domain: &str, host: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    domain.is_empty() || host == domain || host.ends_with(&format!(".{}", domain))
}
