/// Metrics for the two fetch paths
///
/// Tracks attempts, failures, relay timeouts and response times for the
/// proxied path and the direct fallback path.

use crate::http_client::FetchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const PROXIED_PATH: &str = "proxied";
pub const DIRECT_PATH: &str = "direct";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathMetrics {
    pub path: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub http_errors: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub average_response_time_ms: f64,
    pub total_response_time_ms: u64,
}

impl PathMetrics {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            attempts: 0,
            successes: 0,
            failures: 0,
            timeouts: 0,
            http_errors: 0,
            last_success: None,
            last_failure: None,
            last_error: None,
            average_response_time_ms: 0.0,
            total_response_time_ms: 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            (self.successes as f64 / self.attempts as f64) * 100.0
        }
    }

    pub fn record_success(&mut self, response_time: Duration) {
        self.attempts += 1;
        self.successes += 1;
        self.last_success = Some(Utc::now());

        self.total_response_time_ms += response_time.as_millis() as u64;
        self.average_response_time_ms = self.total_response_time_ms as f64 / self.successes as f64;
    }

    pub fn record_failure(&mut self, error: &FetchError) {
        self.attempts += 1;
        self.failures += 1;
        self.last_failure = Some(Utc::now());
        self.last_error = Some(error.to_string());

        match error {
            FetchError::Http { .. } => self.http_errors += 1,
            FetchError::Timeout => self.timeouts += 1,
            _ => {}
        }
    }
}

/// Shared tracker, one entry per path
pub struct MetricsTracker {
    paths: Arc<Mutex<HashMap<String, PathMetrics>>>,
    exhausted: Arc<Mutex<u64>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            paths: Arc::new(Mutex::new(HashMap::new())),
            exhausted: Arc::new(Mutex::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PathMetrics>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one attempt on `path`; `error` is `None` on success.
    pub fn record(&self, path: &str, response_time: Duration, error: Option<&FetchError>) {
        let mut paths = self.lock();
        let metrics = paths
            .entry(path.to_string())
            .or_insert_with(|| PathMetrics::new(path));

        match error {
            None => {
                metrics.record_success(response_time);
                log::debug!(
                    "[{}] Success - {}ms - success rate {:.2}%",
                    path,
                    response_time.as_millis(),
                    metrics.success_rate()
                );
            }
            Some(e) => {
                metrics.record_failure(e);
                log::debug!("[{}] Failure - {} - success rate {:.2}%", path, e, metrics.success_rate());
            }
        }
    }

    /// A relay gave up waiting on the page.
    pub fn record_timeout(&self, path: &str) {
        let mut paths = self.lock();
        paths
            .entry(path.to_string())
            .or_insert_with(|| PathMetrics::new(path))
            .timeouts += 1;
    }

    pub fn record_exhausted(&self) {
        *self.exhausted.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    pub fn exhausted(&self) -> u64 {
        *self.exhausted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_metrics(&self, path: &str) -> Option<PathMetrics> {
        self.lock().get(path).cloned()
    }

    pub fn get_all_metrics(&self) -> Vec<PathMetrics> {
        self.lock().values().cloned().collect()
    }

    /// One log line per path
    pub fn log_summary(&self) {
        let mut all = self.get_all_metrics();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        for m in all {
            log::info!(
                "{} path: {} attempts, {} ok ({:.1}%), {} timeouts, {} HTTP errors, avg {:.0}ms{}",
                m.path,
                m.attempts,
                m.successes,
                m.success_rate(),
                m.timeouts,
                m.http_errors,
                m.average_response_time_ms,
                m.last_error
                    .as_ref()
                    .map(|e| format!(", last error: {}", e))
                    .unwrap_or_default()
            );
        }
        let exhausted = self.exhausted();
        if exhausted > 0 {
            log::warn!("{} fetches failed on both paths", exhausted);
        }
    }

    pub fn export_json(&self) -> String {
        serde_json::to_string_pretty(&*self.lock()).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}
