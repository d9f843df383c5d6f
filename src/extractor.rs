//! Page content extraction for post pages
//!
//! Finds the image list, the video source, the title and the current page
//! number in a post's HTML and decides what kind of download the post offers.

use crate::models::{ContentType, PageContent};
use reqwest::Url;
use scraper::{Html, Selector};

/// Site sections that never hold a downloadable post
const EXCLUDED_PATHS: &[&str] = &[
    "/about/",
    "/upload/",
    "/whats-that-book/",
    "/popular/",
    "/video/",
    "/cats/",
    "/pairing/",
    "/group/",
    "/privacy-policy/",
    "/dmca-notice/",
    "/contact/",
    "/terms-service/",
    "/sitemap/",
    "/my-bookmark/",
    "/tag/",
    "/genre/",
    "/status/",
    "/lang/",
    "/yaoi-manga/",
    "/manhwa/",
];

/// Tried in order; the first one that matches anything wins.
const IMAGE_SELECTORS: &[&str] = &[
    ".img-myreadingmanga",
    ".img-myreadingmanga img",
    ".entry-content img",
    ".separator img",
    "img[decoding='async']",
];

pub fn is_excluded_path(path: &str) -> bool {
    EXCLUDED_PATHS.iter().any(|p| path.starts_with(p))
}

fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

fn exists(document: &Html, selector: &str) -> bool {
    Selector::parse(selector)
        .map(|s| document.select(&s).next().is_some())
        .unwrap_or(false)
}

fn image_sources(document: &Html, base: &Url) -> Vec<String> {
    for raw in IMAGE_SELECTORS {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        let matched: Vec<_> = document.select(&selector).collect();
        if matched.is_empty() {
            continue;
        }
        return matched
            .iter()
            .filter_map(|img| {
                let value = img.value();
                value
                    .attr("src")
                    .filter(|s| !s.is_empty())
                    .or_else(|| value.attr("data-src"))
            })
            .filter_map(|src| base.join(src).ok())
            .map(|u| u.to_string())
            .collect();
    }
    Vec::new()
}

fn video_source(document: &Html, base: &Url) -> Option<String> {
    let selector = Selector::parse("#MRM_video > video > source").ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("src"))
        .and_then(|src| base.join(src).ok())
        .map(|u| u.to_string())
}

fn categories(document: &Html) -> Vec<String> {
    let Ok(selector) = Selector::parse(".entry-categories a") else {
        return Vec::new();
    };
    document
        .select(&selector)
        .map(|a| a.text().collect::<String>().trim().to_lowercase())
        .collect()
}

/// Extract the downloadable content of the post at `page_url`.
pub fn extract(html: &str, page_url: &Url) -> PageContent {
    let document = Html::parse_document(html);

    let images = image_sources(&document, page_url);
    let video = video_source(&document, page_url);
    let title = select_first_text(&document, ".entry-header h1.entry-title").unwrap_or_else(|| "Untitled".to_string());
    let page = select_first_text(&document, ".post-page-numbers.current").unwrap_or_else(|| "1".to_string());

    let excluded = is_excluded_path(page_url.path())
        || exists(&document, "iframe[src*='youtube.com']")
        || exists(&document, ".content-archive");

    let tagged_video = categories(&document).iter().any(|c| c == "video");
    let has_video_block = exists(&document, "#MRM_video");

    let (content_type, reason) = if excluded {
        (ContentType::None, Some("excluded_page".to_string()))
    } else if tagged_video && has_video_block {
        (ContentType::Video, None)
    } else if !tagged_video && !images.is_empty() {
        (ContentType::Images, None)
    } else {
        (ContentType::None, Some("no_content".to_string()))
    };

    log::debug!(
        "Extracted {:?} from {}: {} images, video={}",
        content_type,
        page_url,
        images.len(),
        video.is_some()
    );

    PageContent {
        images,
        video,
        title,
        page,
        has_content: content_type != ContentType::None,
        content_type,
        reason,
    }
}
