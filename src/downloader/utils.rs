// Helper functions for resolver backends

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::errors::{DownloadError, RESOLVER_HINT};

/// Run a command to completion, collecting stdout/stderr.
///
/// The child is killed when `limit` elapses or `cancel` fires.
pub async fn run_output_with_timeout(
    program: &Path,
    args: Vec<String>,
    limit: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<Output, DownloadError> {
    tracing::debug!(program = %program.display(), args = ?args, "Spawning");

    let mut child = TokioCommand::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| DownloadError::NetworkError(format!("Failed to capture stdout from {}", program.display())))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| DownloadError::NetworkError(format!("Failed to capture stderr from {}", program.display())))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });

    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    let waited = tokio::select! {
        waited = timeout(limit, child.wait()) => waited,
        _ = cancelled => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(DownloadError::Cancelled);
        }
    };

    match waited {
        Ok(status) => {
            let status = status?;
            let stdout = join_pipe(stdout_task).await?;
            let stderr = join_pipe(stderr_task).await?;
            Ok(Output { status, stdout, stderr })
        }
        Err(_) => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(DownloadError::NetworkError(format!(
                "{} timed out after {}s",
                program.display(),
                limit.as_secs()
            )))
        }
    }
}

async fn join_pipe(
    task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
) -> Result<Vec<u8>, DownloadError> {
    task.await
        .map_err(|e| DownloadError::NetworkError(format!("Output reader failed: {}", e)))?
        .map_err(DownloadError::from)
}

/// A missing executable comes back with an install hint: the transcoder as
/// `TranscodeError`, anything else as `NetworkError` since nothing can be
/// resolved without it.
pub fn spawn_error(program: &Path, error: std::io::Error) -> DownloadError {
    let message = format!("Failed to start {}: {}", program.display(), error);
    if error.kind() != std::io::ErrorKind::NotFound {
        return DownloadError::FilesystemError(message);
    }

    let is_transcoder = program
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.starts_with("ffmpeg") || s.starts_with("ffprobe"));
    if is_transcoder {
        DownloadError::TranscodeError(message)
    } else {
        DownloadError::NetworkError(format!("{}. {}", message, RESOLVER_HINT))
    }
}

/// Last non-empty stderr line starting with "ERROR:", or the whole text
pub fn error_summary(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with("ERROR:"))
        .map(|l| l.trim_start_matches("ERROR:").trim().to_string())
        .unwrap_or_else(|| stderr.trim().to_string())
}
