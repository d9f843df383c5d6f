use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use log::LevelFilter;
use mrm_downloader::app_state::AppState;
use mrm_downloader::config::Settings;
use mrm_downloader::downloader::Downloader;
use mrm_downloader::extractor;
use mrm_downloader::history::DownloadHistory;
use mrm_downloader::models::{ContentType, DownloadKind, DownloadStatus};
use reqwest::Url;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Images,
    Video,
    All,
    Pdf,
}

impl From<Mode> for DownloadKind {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Images => DownloadKind::Images,
            Mode::Video => DownloadKind::Video,
            Mode::All => DownloadKind::All,
            Mode::Pdf => DownloadKind::Pdf,
        }
    }
}

/// Download the images or video of a post page into an archive
#[derive(Debug, Parser)]
#[command(name = "mrm-downloader", version)]
struct Args {
    /// Post page URL
    page_url: String,

    /// What to download; defaults to whatever the page offers
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Settings file (defaults to ./config.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory, overrides `download_dir`
    #[arg(long)]
    output: Option<PathBuf>,
}

/// `log4rs.yml` owns the levels unless debug mode asks for everything on the
/// console.
fn init_logging(debug: bool) {
    if !debug && Path::new("log4rs.yml").exists() {
        match log4rs::init_file("log4rs.yml", Default::default()) {
            Ok(()) => return,
            Err(e) => eprintln!("Invalid log4rs.yml, logging to console: {}", e),
        }
    }

    use log4rs::append::console::ConsoleAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%H:%M:%S)} {h({l:<5})} {t} - {m}{n}")))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level));

    match config {
        Ok(config) => {
            if let Err(e) = log4rs::init_config(config) {
                eprintln!("Failed to initialize logging: {}", e);
            }
        }
        Err(e) => eprintln!("Failed to build logging config: {}", e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load(),
    };
    init_logging(settings.debug_mode);

    let page_url = Url::parse(&args.page_url).with_context(|| format!("invalid page URL {}", args.page_url))?;
    let output_dir = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&settings.download_dir));

    log::info!("Settings loaded:");
    log::info!("  Retry count: {}", settings.retry_count);
    log::info!("  Timeout: {}s", settings.timeout_secs);
    log::info!("  Use cookies: {} ({:?})", settings.use_cookies, settings.cookie_source);

    let state = AppState::new(settings)?;

    let html = state
        .direct_client
        .get_text(page_url.as_str())
        .await
        .with_context(|| format!("failed to load {}", page_url))?;
    let content = extractor::extract(&html, &page_url);
    if !content.has_content {
        bail!(
            "Nothing to download on {} ({})",
            page_url,
            content.reason.as_deref().unwrap_or("no_content")
        );
    }

    let kind = args.mode.map(DownloadKind::from).unwrap_or(match content.content_type {
        ContentType::Video => DownloadKind::Video,
        _ => DownloadKind::Images,
    });
    log::info!("Downloading {:?} from \"{}\" page {}", kind, content.title, content.page);

    let page = state.open_page(&page_url)?;
    let downloader = Downloader::new(page.orchestrator.clone(), page_url.as_str());
    let mut history = DownloadHistory::open(&state.settings.history_file)?;
    let history_title = match kind {
        DownloadKind::Video => content.title.clone(),
        DownloadKind::Pdf => format!("{} - Page {} (PDF)", content.title, content.page),
        _ => format!("{} - Page {}", content.title, content.page),
    };

    let result = downloader.download(kind, &content).await;
    state.metrics.log_summary();
    page.session.close();

    let output = match result {
        Ok(output) => output,
        Err(e) => {
            let failed_title = match kind {
                DownloadKind::Pdf => &content.title,
                _ => &history_title,
            };
            history.add(failed_title, page_url.as_str(), kind, DownloadStatus::Failed)?;
            return Err(e.into());
        }
    };

    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let path = output_dir.join(&output.filename);
    std::fs::write(&path, &output.data).with_context(|| format!("failed to write {}", path.display()))?;

    if !output.skipped.is_empty() {
        log::warn!("{} media files could not be downloaded", output.skipped.len());
    }
    history.add(&history_title, page_url.as_str(), kind, DownloadStatus::Completed)?;
    log::info!("Saved {} ({} bytes)", path.display(), output.data.len());

    Ok(())
}
