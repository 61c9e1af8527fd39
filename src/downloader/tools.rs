use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

/// External executables the yt-dlp resolver depends on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToolType {
    YtDlp,
    /// Transcoder used for audio extraction and merging
    Ffmpeg,
}

impl ToolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::YtDlp => "yt-dlp",
            ToolType::Ffmpeg => "ffmpeg",
        }
    }

    fn version_arg(&self) -> &'static str {
        match self {
            ToolType::YtDlp => "--version",
            ToolType::Ffmpeg => "-version",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStatus {
    pub name: String,
    pub tool_type: ToolType,
    pub version: Option<String>,
    pub path: Option<PathBuf>,
    pub is_available: bool,
}

#[derive(Debug, Default)]
pub struct ToolManager;

impl ToolManager {
    pub fn new() -> Self {
        Self
    }

    pub fn status(&self, tool_type: ToolType) -> ToolStatus {
        let path = find_binary(tool_type);
        let version = path.as_deref().and_then(|p| version_of(p, tool_type));

        ToolStatus {
            name: tool_type.as_str().to_string(),
            tool_type,
            is_available: path.is_some(),
            version,
            path,
        }
    }
}

/// Locate a tool: Homebrew/system locations first, then PATH
pub fn find_binary(tool_type: ToolType) -> Option<PathBuf> {
    let name = tool_type.as_str();
    let common_paths = [
        format!("/opt/homebrew/bin/{}", name), // Homebrew on Apple Silicon
        format!("/usr/local/bin/{}", name),    // Homebrew on Intel Mac
        format!("/usr/bin/{}", name),
    ];

    common_paths
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .or_else(|| which::which(name).ok())
}

/// Whether audio extraction can run on this machine
pub fn transcoder_available() -> bool {
    find_binary(ToolType::Ffmpeg).is_some()
}

fn version_of(path: &Path, tool_type: ToolType) -> Option<String> {
    match Command::new(path).arg(tool_type.version_arg()).output() {
        Ok(output) if output.status.success() => {
            // ffmpeg prints a banner; keep the first line only
            let out = String::from_utf8_lossy(&output.stdout);
            out.lines().next().map(|l| l.trim().to_string())
        }
        Ok(output) => {
            tracing::debug!(tool = tool_type.as_str(), status = %output.status, "Version probe failed");
            None
        }
        Err(e) => {
            tracing::debug!(tool = tool_type.as_str(), error = %e, "Version probe failed");
            None
        }
    }
}
