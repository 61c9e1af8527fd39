// Engine configuration
//
// Everything the original app kept in process-wide state (download path,
// proxy, cookies) is an explicit field here and is handed to sessions and
// resolvers at construction time.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::models::{AudioTranscode, StreamKind};

/// Progress coalescing policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Minimum fraction change that counts as meaningful (default: 0.001 = 0.1%)
    #[serde(default = "default_min_fraction_delta")]
    pub min_fraction_delta: f64,

    /// Window inside which insignificant updates are suppressed (default: 250 ms)
    #[serde(default = "default_coalesce_window_ms")]
    pub coalesce_window_ms: u64,
}

impl TrackerConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_fraction_delta: default_min_fraction_delta(),
            coalesce_window_ms: default_coalesce_window_ms(),
        }
    }
}

/// Settings for the yt-dlp resolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YtDlpConfig {
    /// Explicit path to the yt-dlp binary (default: search PATH and common locations)
    #[serde(default)]
    pub binary: Option<PathBuf>,

    /// SOCKS5/HTTP proxy URL
    #[serde(default)]
    pub proxy: Option<String>,

    /// Path to cookies.txt file
    #[serde(default)]
    pub cookies_path: Option<PathBuf>,

    /// Browser to read cookies from (e.g. "chrome")
    #[serde(default)]
    pub cookies_from_browser: Option<String>,

    /// Per-socket timeout passed to yt-dlp in seconds (default: 30)
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_secs: u32,

    /// Wall-clock limit for a metadata probe in seconds (default: 60)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Audio codec for audio downloads (default: "mp3")
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,

    /// Audio quality in kbps (default: "192")
    #[serde(default = "default_audio_quality")]
    pub audio_quality: String,

    /// Audio sample rate in Hz (default: 44100)
    #[serde(default = "default_sample_rate")]
    pub audio_sample_rate: u32,
}

impl YtDlpConfig {
    pub fn audio_transcode(&self) -> AudioTranscode {
        AudioTranscode {
            codec: self.audio_codec.clone(),
            quality: self.audio_quality.clone(),
            sample_rate: self.audio_sample_rate,
        }
    }
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self {
            binary: None,
            proxy: None,
            cookies_path: None,
            cookies_from_browser: None,
            socket_timeout_secs: default_socket_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            audio_codec: default_audio_codec(),
            audio_quality: default_audio_quality(),
            audio_sample_rate: default_sample_rate(),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where downloads land unless a session overrides it (default: user Downloads dir)
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Kind filter applied to new sessions (default: Video)
    #[serde(default)]
    pub default_kind: StreamKind,

    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub ytdlp: YtDlpConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            default_kind: StreamKind::default(),
            tracker: TrackerConfig::default(),
            ytdlp: YtDlpConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn with_default_kind(mut self, kind: StreamKind) -> Self {
        self.default_kind = kind;
        self
    }

    pub fn with_tracker(mut self, tracker: TrackerConfig) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.ytdlp.proxy = proxy;
        self
    }

    pub fn with_cookies_path(mut self, path: Option<PathBuf>) -> Self {
        self.ytdlp.cookies_path = path;
        self
    }
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_min_fraction_delta() -> f64 {
    0.001
}

fn default_coalesce_window_ms() -> u64 {
    250
}

fn default_socket_timeout() -> u32 {
    30
}

fn default_probe_timeout() -> u64 {
    60
}

fn default_audio_codec() -> String {
    "mp3".to_string()
}

fn default_audio_quality() -> String {
    "192".to_string()
}

fn default_sample_rate() -> u32 {
    44100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(
            r#"{"download_dir": "/tmp/media", "tracker": {"coalesce_window_ms": 50}}"#,
        )
        .unwrap();

        assert_eq!(config.download_dir, PathBuf::from("/tmp/media"));
        assert_eq!(config.tracker.coalesce_window(), Duration::from_millis(50));
        assert_eq!(config.tracker.min_fraction_delta, 0.001);
        assert_eq!(config.default_kind, StreamKind::Video);
        assert_eq!(config.ytdlp.audio_codec, "mp3");
        assert_eq!(config.ytdlp.audio_sample_rate, 44100);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::default()
            .with_default_kind(StreamKind::Audio)
            .with_proxy(Some("socks5://127.0.0.1:1080".to_string()));
        assert_eq!(config.default_kind, StreamKind::Audio);
        assert_eq!(config.ytdlp.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
    }
}
