// Library interface for mrm_downloader
// The binary and the integration tests both build on these modules

pub mod app_state;
pub mod archive;
pub mod bridge;
pub mod config;
pub mod downloader;
pub mod extractor;
pub mod history;
pub mod http_client;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod protocol;
