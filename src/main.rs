use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use media_fetch::downloader::tools::{ToolManager, ToolType};
use media_fetch::{
    Downloader, EngineConfig, ErrorKind, EventSink, FormatCatalog, ProgressEvent, ProgressPhase,
    SessionId, SessionState, StreamKind, YtDlpResolver,
};

/// Resolve a media URL, list its formats and download one
#[derive(Debug, Parser)]
#[command(name = "media-fetch", version, about)]
struct Cli {
    /// Media page URL
    url: String,

    /// Download audio only (converted to mp3)
    #[arg(long)]
    audio: bool,

    /// Format id to download (default: best in the catalog)
    #[arg(short, long)]
    format: Option<String>,

    /// Destination directory (default: Downloads)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// List formats and exit
    #[arg(long)]
    list: bool,

    /// SOCKS5/HTTP proxy URL
    #[arg(long)]
    proxy: Option<String>,

    /// cookies.txt for sites that need a login
    #[arg(long)]
    cookies: Option<PathBuf>,

    /// JSON engine configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Prints engine updates to the terminal
#[derive(Debug, Default)]
struct CliSink {
    catalog: Option<FormatCatalog>,
    error: Option<(ErrorKind, String)>,
    state: Option<SessionState>,
}

impl EventSink for CliSink {
    fn on_catalog_updated(&mut self, _session: SessionId, catalog: &FormatCatalog) {
        self.catalog = Some(catalog.clone());
    }

    fn on_progress(&mut self, _session: SessionId, event: &ProgressEvent) {
        let percent = event
            .fraction_complete
            .map(|f| format!("{:5.1}%", f * 100.0))
            .unwrap_or_else(|| "  ?  ".to_string());
        let rate = event
            .transfer_rate_bytes_per_sec
            .map(|r| format!(" at {:.2} MiB/s", r / 1024.0 / 1024.0))
            .unwrap_or_default();

        let mut err = std::io::stderr();
        let _ = match event.phase {
            ProgressPhase::Started => write!(err, "Starting download..."),
            ProgressPhase::Downloading => write!(err, "\r[download] {}{}   ", percent, rate),
            ProgressPhase::Transcoding => write!(err, "\r[convert] post-processing...          "),
            ProgressPhase::Finished => writeln!(err, "\r[done] 100.0%                          "),
            ProgressPhase::Failed => writeln!(err),
        };
        let _ = err.flush();
    }

    fn on_session_state_changed(&mut self, session: SessionId, state: SessionState) {
        tracing::debug!(session_id = %session, %state, "State changed");
        self.state = Some(state);
    }

    fn on_error(&mut self, _session: SessionId, kind: ErrorKind, message: &str) {
        self.error = Some((kind, message.to_string()));
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("media_fetch=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = &cli.output {
        config = config.with_download_dir(dir);
    }
    if cli.proxy.is_some() {
        config = config.with_proxy(cli.proxy.clone());
    }
    if cli.cookies.is_some() {
        config = config.with_cookies_path(cli.cookies.clone());
    }
    let kind = if cli.audio { StreamKind::Audio } else { config.default_kind };
    config = config.with_default_kind(kind);

    // Only audio downloads need the transcoder; the lookup runs the binary
    if cli.audio {
        let ffmpeg = tokio::task::spawn_blocking(|| ToolManager::new().status(ToolType::Ffmpeg)).await?;
        match (&ffmpeg.version, ffmpeg.is_available) {
            (Some(version), true) => tracing::debug!(tool = %ffmpeg.name, %version, "Tool found"),
            (None, true) => tracing::debug!(tool = %ffmpeg.name, "Tool found"),
            (_, false) => tracing::warn!(tool = %ffmpeg.name, "Tool not found, audio conversion will fail"),
        }
    }

    let resolver = Arc::new(YtDlpResolver::new(config.ytdlp.clone()));
    tracing::debug!(binary = %resolver.binary().display(), "Resolver ready");
    let mut engine = Downloader::new(config, resolver, CliSink::default());
    let id = engine.create_session();

    engine.submit_url(id, &cli.url)?;
    run_until_settled(&mut engine, id).await?;

    if let Some((kind, message)) = engine.sink_mut().error.take() {
        return Err(format!("{:?}: {}", kind, message).into());
    }

    let catalog = engine
        .session(id)
        .map(|s| s.catalog().clone())
        .unwrap_or_else(|| FormatCatalog::empty(kind));
    if catalog.is_empty() {
        return Err(format!("No {} formats available for {}", kind, cli.url).into());
    }

    if cli.list {
        for format in catalog.formats() {
            let estimated = match format.size {
                Some(size) if !size.is_exact() => "  (estimated size)",
                _ => "",
            };
            println!("{:>8}  {}{}", format.id, format.label(), estimated);
        }
        return Ok(());
    }

    let format_id = match &cli.format {
        Some(id) => id.clone(),
        None => catalog.formats()[0].id.clone(),
    };
    engine.select_format(id, &format_id)?;
    if let Some(format) = catalog.get(&format_id) {
        println!("Downloading {}", format.label());
    }

    engine.start_download(id)?;
    run_until_settled(&mut engine, id).await?;

    if let Some((kind, message)) = engine.sink_mut().error.take() {
        return Err(format!("{:?}: {}", kind, message).into());
    }
    println!("Saved to {}", engine.config().download_dir.display());
    Ok(())
}

/// Deliver engine updates until the session is idle again; Ctrl+C cancels
async fn run_until_settled(
    engine: &mut Downloader<CliSink>,
    id: SessionId,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    tokio::select! {
        _ = engine.settle(id) => Ok(()),
        _ = tokio::signal::ctrl_c() => {
            engine.cancel(id);
            eprintln!();
            Err("Cancelled".into())
        }
    }
}
