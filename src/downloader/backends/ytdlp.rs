// yt-dlp resolver - drives the yt-dlp executable as a subprocess
//
// probe:        yt-dlp --dump-json --no-playlist <url>
// fetch_stream: yt-dlp -f <id> --newline --progress-template ... -P <dir> <url>
//
// Progress comes from our own --progress-template line; the human-readable
// "[download]  12.5% of ..." line is parsed as a fallback.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;

use crate::downloader::config::YtDlpConfig;
use crate::downloader::errors::DownloadError;
use crate::downloader::models::{RawMetadata, RawProgress, StreamRequest};
use crate::downloader::tools::{self, ToolType};
use crate::downloader::traits::{ProgressCallback, Resolver};
use crate::downloader::utils::{error_summary, run_output_with_timeout, spawn_error};

const PROGRESS_MARKER: &str = "[progress]";
const PROGRESS_TEMPLATE: &str = "download:[progress] %(progress.downloaded_bytes)s \
     %(progress.total_bytes)s %(progress.total_bytes_estimate)s %(progress.speed)s";
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

lazy_static! {
    // [download]  12.5% of ~ 310.04MiB at  374.36KiB/s ETA 11:59 (frag 56/454)
    static ref PERCENT_RE: Regex = Regex::new(
        r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~?\s*(\d+\.?\d*\s*\w+)(?:\s+at\s+(\d+\.?\d*\s*\w+)/s)?"
    )
    .unwrap();
    static ref POSTPROCESS_RE: Regex = Regex::new(r"^\[(ExtractAudio|Merger|ffmpeg|FixupM3u8|VideoConvertor)\]").unwrap();
    static ref ALREADY_RE: Regex = Regex::new(r"has already been downloaded").unwrap();
    static ref SIZE_RE: Regex = Regex::new(r"^(\d+\.?\d*)\s*([KMGT]?i?B)$").unwrap();
}

pub struct YtDlpResolver {
    binary: PathBuf,
    config: YtDlpConfig,
}

impl YtDlpResolver {
    pub fn new(config: YtDlpConfig) -> Self {
        let binary = config
            .binary
            .clone()
            .or_else(|| tools::find_binary(ToolType::YtDlp))
            .unwrap_or_else(|| PathBuf::from(ToolType::YtDlp.as_str()));

        tracing::debug!(binary = %binary.display(), "Using yt-dlp");
        Self { binary, config }
    }

    pub fn binary(&self) -> &std::path::Path {
        &self.binary
    }

    /// Network options shared by probe and download
    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--socket-timeout".to_string(),
            self.config.socket_timeout_secs.to_string(),
        ];

        // Cookies
        if let Some(path) = &self.config.cookies_path {
            args.push("--cookies".to_string());
            args.push(path.display().to_string());
        } else if let Some(browser) = &self.config.cookies_from_browser {
            args.push("--cookies-from-browser".to_string());
            args.push(browser.clone());
        }

        // Proxy
        if let Some(proxy) = &self.config.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }

        args
    }

    fn probe_args(&self, url: &str) -> Vec<String> {
        let mut args = vec!["--dump-json".to_string()];
        args.extend(self.common_args());
        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    fn download_args(&self, request: &StreamRequest) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            request.format_id.clone(),
            "--newline".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
            "-P".to_string(),
            request.destination.display().to_string(),
            "-o".to_string(),
            OUTPUT_TEMPLATE.to_string(),
        ];
        args.extend(self.common_args());

        // Audio extraction through ffmpeg
        if let Some(transcode) = &request.transcode {
            args.extend([
                "-x".to_string(),
                "--audio-format".to_string(),
                transcode.codec.clone(),
                "--audio-quality".to_string(),
                format!("{}K", transcode.quality),
                "--postprocessor-args".to_string(),
                format!("ExtractAudio:-ar {}", transcode.sample_rate),
            ]);
        }

        args.push("--".to_string());
        args.push(request.url.clone());
        args
    }
}

#[async_trait]
impl Resolver for YtDlpResolver {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn probe(&self, url: &str, cancel: &CancellationToken) -> Result<RawMetadata, DownloadError> {
        if url.trim().is_empty() || url.chars().any(char::is_whitespace) {
            return Err(DownloadError::InvalidUrl(url.to_string()));
        }

        let output = run_output_with_timeout(
            &self.binary,
            self.probe_args(url),
            Duration::from_secs(self.config.probe_timeout_secs),
            Some(cancel),
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let summary = error_summary(&stderr);
            tracing::debug!(%url, status = %output.status, stderr = %stderr, "yt-dlp probe failed");
            if summary.is_empty() {
                return Err(DownloadError::NetworkError(format!(
                    "yt-dlp exited with {}",
                    output.status
                )));
            }
            return Err(DownloadError::classify(&summary));
        }

        RawMetadata::from_json(&output.stdout)
            .map_err(|e| DownloadError::Unsupported(format!("Unreadable yt-dlp metadata: {}", e)))
    }

    async fn fetch_stream(
        &self,
        request: &StreamRequest,
        progress: &ProgressCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if request.transcode.is_some() && !tools::transcoder_available() {
            return Err(DownloadError::TranscodeError(
                "ffmpeg not found, audio extraction is unavailable".to_string(),
            ));
        }

        tokio::fs::create_dir_all(&request.destination)
            .await
            .map_err(|e| {
                DownloadError::FilesystemError(format!(
                    "Cannot create {}: {}",
                    request.destination.display(),
                    e
                ))
            })?;

        let args = self.download_args(request);
        tracing::debug!(binary = %self.binary.display(), args = ?args, "Starting yt-dlp download");

        let mut child = TokioCommand::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.binary, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::NetworkError("Failed to capture yt-dlp stdout".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::NetworkError("Failed to capture yt-dlp stderr".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(format_id = %request.format_id, "Killing yt-dlp after cancellation");
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return Err(DownloadError::Cancelled);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(raw) = parse_line(&line) {
                            progress(raw);
                        } else if !line.starts_with(PROGRESS_MARKER) {
                            tracing::debug!("[yt-dlp] {}", line);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read yt-dlp output");
                        break;
                    }
                },
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            return Ok(());
        }

        let summary = error_summary(&stderr);
        if summary.is_empty() {
            return Err(DownloadError::NetworkError(format!("yt-dlp exited with {}", status)));
        }
        Err(DownloadError::classify(&summary))
    }
}

/// Turn one yt-dlp stdout line into a raw progress callback
fn parse_line(line: &str) -> Option<RawProgress> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix(PROGRESS_MARKER) {
        return parse_template(rest);
    }

    if let Some(caps) = PERCENT_RE.captures(line) {
        let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
        let total = caps.get(2).and_then(|m| parse_size(m.as_str()));
        let rate = caps.get(3).and_then(|m| parse_size(m.as_str()));
        let downloaded = total.map_or(0, |t| (t * percent / 100.0) as u64);
        return Some(RawProgress::downloading(downloaded, total, rate));
    }

    if POSTPROCESS_RE.is_match(line) {
        return Some(RawProgress::transcoding());
    }

    if ALREADY_RE.is_match(line) {
        return Some(RawProgress::finished());
    }

    None
}

/// "<downloaded> <total> <estimate> <speed>", with NA for unknown values
fn parse_template(rest: &str) -> Option<RawProgress> {
    let mut fields = rest.split_whitespace().map(parse_number);
    let downloaded = fields.next()??;
    let total = fields.next().flatten();
    let estimate = fields.next().flatten();
    let rate = fields.next().flatten();

    Some(RawProgress::downloading(
        downloaded.max(0.0) as u64,
        total.or(estimate),
        rate,
    ))
}

fn parse_number(field: &str) -> Option<f64> {
    field.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// "310.04MiB" -> bytes
fn parse_size(text: &str) -> Option<f64> {
    let caps = SIZE_RE.captures(text.trim())?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier = match caps.get(2)?.as_str() {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some(value * multiplier)
}
