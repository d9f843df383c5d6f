//! Download routines: fetch every media file of a post through the
//! orchestrator and bundle the results.

use crate::archive::{ArchiveBuilder, ArchiveError, PdfArchiveBuilder, ZipArchiveBuilder};
use crate::models::{DownloadKind, DownloadOutput, PageContent};
use crate::orchestrator::{FetchError, FetchOrchestrator};
use crate::protocol::FetchOptions;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("No {0} to download")]
    NoMedia(&'static str),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("HTTP error! status: {0}")]
    Status(u16),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),
}

/// Receives progress updates, `percent` in 0..=100.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, percent: f32, message: &str);
}

/// Writes progress to the log
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn progress(&self, percent: f32, message: &str) {
        log::info!("[{:>3.0}%] {}", percent, message);
    }
}

/// Lowercased title with every non-alphanumeric character replaced by `_`.
pub fn safe_title(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// File extension from a MIME subtype, `image/png` -> `png`.
fn extension_from_mime(mime: Option<&str>) -> Option<String> {
    mime.and_then(|m| m.split_once('/'))
        .map(|(_, subtype)| subtype.split(';').next().unwrap_or_default().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Extension for a video file: the MIME subtype if any, else whatever follows
/// the last dot of the URL. Anything longer than five characters is not a
/// real extension and becomes `mp4`.
pub fn video_extension(mime: Option<&str>, url: &str) -> String {
    let candidate = extension_from_mime(mime)
        .or_else(|| url.rsplit('.').next().map(str::to_string))
        .unwrap_or_else(|| "mp4".to_string());
    let candidate = candidate
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_string();
    if candidate.is_empty() || candidate.len() > 5 {
        "mp4".to_string()
    } else {
        candidate
    }
}

struct Media {
    data: Vec<u8>,
    mime: Option<String>,
}

pub struct Downloader {
    orchestrator: Arc<FetchOrchestrator>,
    referer: String,
    progress: Arc<dyn ProgressSink>,
}

impl Downloader {
    /// `referer` is the post page; every media request carries it.
    pub fn new(orchestrator: Arc<FetchOrchestrator>, referer: &str) -> Self {
        Self {
            orchestrator,
            referer: referer.to_string(),
            progress: Arc::new(LogProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub async fn download(&self, kind: DownloadKind, content: &PageContent) -> Result<DownloadOutput, DownloadError> {
        match kind {
            DownloadKind::Images => self.download_images(content).await,
            DownloadKind::Video => self.download_video(content).await,
            DownloadKind::All => self.download_all(content).await,
            DownloadKind::Pdf => self.download_pdf(content).await,
        }
    }

    async fn fetch_media(&self, url: &str) -> Result<Media, DownloadError> {
        let options = FetchOptions::get().with_header("Referer", &self.referer);
        let response = self.orchestrator.fetch(url, &options).await?;
        if !response.ok() {
            return Err(DownloadError::Status(response.status));
        }
        let mime = response.content_type().map(str::to_string);
        let data = response.bytes().await?;
        Ok(Media { data, mime })
    }

    /// Fetch every image into `archive` under `prefix`. Images that fail to
    /// download or that the archive cannot decode are logged and skipped.
    async fn collect_images<A: ArchiveBuilder>(
        &self,
        images: &[String],
        prefix: &str,
        archive: &mut A,
        progress_base: f32,
        progress_span: f32,
    ) -> Result<Vec<String>, DownloadError> {
        let mut skipped = Vec::new();
        for (i, url) in images.iter().enumerate() {
            let percent = progress_base + ((i + 1) as f32 / images.len() as f32) * progress_span;
            self.progress.progress(
                percent,
                &format!("Downloading image {} of {}...", i + 1, images.len()),
            );

            match self.fetch_media(url).await {
                Ok(media) => {
                    let ext = extension_from_mime(media.mime.as_deref()).unwrap_or_else(|| "jpg".to_string());
                    match archive.add(&format!("{}image_{}.{}", prefix, i + 1, ext), &media.data) {
                        Ok(()) => log::debug!("Downloaded image {}/{}: {}", i + 1, images.len(), url),
                        Err(ArchiveError::Image(e)) => {
                            log::error!("Error processing image {}: {}", url, e);
                            skipped.push(url.clone());
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => {
                    log::error!("Error downloading image {}: {}", url, e);
                    skipped.push(url.clone());
                }
            }
        }
        Ok(skipped)
    }

    pub async fn download_images(&self, content: &PageContent) -> Result<DownloadOutput, DownloadError> {
        if content.images.is_empty() {
            return Err(DownloadError::NoMedia("images"));
        }
        self.progress.progress(0.0, "Starting download...");

        let mut archive = ZipArchiveBuilder::new();
        let skipped = self.collect_images(&content.images, "", &mut archive, 0.0, 90.0).await?;

        self.progress.progress(95.0, "Creating ZIP file...");
        let data = archive.finish()?;
        self.progress.progress(100.0, "Download completed");

        Ok(DownloadOutput {
            filename: format!("{}_p{}_images.zip", safe_title(&content.title), content.page),
            data,
            skipped,
        })
    }

    /// One page per image. Fails when no image could be placed.
    pub async fn download_pdf(&self, content: &PageContent) -> Result<DownloadOutput, DownloadError> {
        if content.images.is_empty() {
            return Err(DownloadError::NoMedia("images"));
        }
        self.progress.progress(0.0, "Initializing PDF generation...");

        let mut pdf = PdfArchiveBuilder::new();
        let skipped = self.collect_images(&content.images, "", &mut pdf, 0.0, 90.0).await?;

        self.progress.progress(95.0, "Finalizing PDF...");
        let data = pdf.finish()?;
        self.progress.progress(100.0, "PDF saved!");

        Ok(DownloadOutput {
            filename: format!("{}_p{}_manga.pdf", safe_title(&content.title), content.page),
            data,
            skipped,
        })
    }

    pub async fn download_video(&self, content: &PageContent) -> Result<DownloadOutput, DownloadError> {
        let Some(video_url) = content.video.as_deref() else {
            return Err(DownloadError::NoMedia("video"));
        };
        self.progress.progress(10.0, "Fetching video...");

        let media = self.fetch_media(video_url).await?;
        self.progress.progress(90.0, "Saving video...");

        Ok(DownloadOutput {
            filename: format!("{}_video.{}", safe_title(&content.title), video_extension(media.mime.as_deref(), video_url)),
            data: media.data,
            skipped: Vec::new(),
        })
    }

    /// Images under `images/` plus the video under `video/`, in one ZIP. A
    /// failed video fails the whole download.
    pub async fn download_all(&self, content: &PageContent) -> Result<DownloadOutput, DownloadError> {
        let has_images = !content.images.is_empty();
        let video_url = content.video.as_deref();
        if !has_images && video_url.is_none() {
            return Err(DownloadError::NoMedia("images or video"));
        }
        self.progress.progress(0.0, "Preparing files...");

        let mut archive = ZipArchiveBuilder::new();
        let mut progress_base = 0.0;
        let progress_span = if has_images && video_url.is_some() { 45.0 } else { 90.0 };

        let mut skipped = Vec::new();
        if has_images {
            skipped = self
                .collect_images(&content.images, "images/", &mut archive, progress_base, progress_span)
                .await?;
            progress_base += progress_span;
        }

        if let Some(video_url) = video_url {
            self.progress.progress(progress_base + 5.0, "Fetching video...");
            let media = self.fetch_media(video_url).await?;
            let ext = video_extension(media.mime.as_deref(), video_url);
            archive.add(&format!("video/video.{}", ext), &media.data)?;
            self.progress.progress(progress_base + 45.0, "Added video to ZIP...");
        }

        self.progress.progress(95.0, "Creating ZIP file...");
        let data = archive.finish()?;
        self.progress.progress(100.0, "Saved ZIP file");

        Ok(DownloadOutput {
            filename: format!("{}_p{}_all.zip", safe_title(&content.title), content.page),
            data,
            skipped,
        })
    }
}
