use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Video,
    Images,
    None,
}

/// Everything the downloader needs to know about a post page.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageContent {
    pub images: Vec<String>,
    pub video: Option<String>,
    pub title: String,
    pub page: String,
    pub content_type: ContentType,
    pub has_content: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadKind {
    Images,
    Video,
    All,
    Pdf,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Completed,
    Failed,
}

/// A finished download, ready to be written out.
#[derive(Debug, Clone)]
pub struct DownloadOutput {
    pub filename: String,
    pub data: Vec<u8>,
    /// Media files that could not be fetched and were left out
    pub skipped: Vec<String>,
}
