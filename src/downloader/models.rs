// Common data models for the fetch/download engine

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identifier of one logical user interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Identifier of one fetch or download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Which kind of stream the consumer wants to see
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StreamKind {
    #[default]
    Video,
    Audio,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// File size as declared by the host, or estimated from bitrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeEstimate {
    Exact(u64),
    Approximate(u64),
}

impl SizeEstimate {
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Exact(b) | Self::Approximate(b) => *b,
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }
}

/// One downloadable stream variant, immutable once produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub id: String,
    pub kind: StreamKind,
    /// Container extension (mp4, webm, m4a)
    pub container: String,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub average_bitrate_kbps: Option<f64>,
    pub size: Option<SizeEstimate>,
}

impl StreamFormat {
    /// Display label, e.g. "1080p 30fps - 47.68 MB" or "Audio 128kbps (m4a) - 3.10 MB"
    pub fn label(&self) -> String {
        let size = match self.size {
            Some(s) if s.bytes() > 0 => format!("{:.2} MB", s.bytes() as f64 / 1_048_576.0),
            _ => "N/A".to_string(),
        };

        match self.kind {
            StreamKind::Video => {
                let resolution = self
                    .height
                    .map(|h| format!("{}p", h))
                    .unwrap_or_else(|| "Unknown".to_string());
                let fps = self
                    .frame_rate
                    .filter(|f| *f > 0.0)
                    .map(|f| format!(" {}fps", f))
                    .unwrap_or_default();
                format!("{}{} - {}", resolution, fps, size)
            }
            StreamKind::Audio => {
                let bitrate = self
                    .average_bitrate_kbps
                    .map(|b| format!("{}kbps", b))
                    .unwrap_or_else(|| "Unknown bitrate".to_string());
                format!("Audio {} ({}) - {}", bitrate, self.container, size)
            }
        }
    }
}

/// Raw format entry as reported by the resolver (yt-dlp JSON shape)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFormat {
    #[serde(default)]
    pub format_id: String,
    #[serde(default)]
    pub ext: String,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub height: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub width: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    /// Video codec (avc1, vp9, av01, none)
    #[serde(default)]
    pub vcodec: Option<String>,
    /// Audio codec (mp4a, opus, none)
    #[serde(default)]
    pub acodec: Option<String>,
    /// Average audio bitrate in kbps
    #[serde(default)]
    pub abr: Option<f64>,
    /// Total bitrate in kbps
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub filesize: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub filesize_approx: Option<u64>,
}

// yt-dlp writes the literal "none" for an absent stream; a missing field
// (generic extractor, direct file links) means "not reported", not "absent"
fn codec_present(codec: &Option<String>) -> bool {
    codec.as_deref() != Some("none")
}

impl RawFormat {
    pub fn has_video(&self) -> bool {
        codec_present(&self.vcodec)
    }

    pub fn has_audio(&self) -> bool {
        codec_present(&self.acodec)
    }

    /// Audio track with a video codec explicitly reported as "none"
    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && self.vcodec.as_deref() == Some("none")
    }

    /// Exact size when declared, approximate otherwise
    pub fn size(&self) -> Option<SizeEstimate> {
        self.filesize
            .map(SizeEstimate::Exact)
            .or(self.filesize_approx.map(SizeEstimate::Approximate))
    }
}

/// Opaque probe result cached per session until the URL changes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    /// Canonical page URL, preferred over the submitted one for downloads
    #[serde(default)]
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
}

impl RawMetadata {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    // yt-dlp emits some sizes as floats (e.g. filesize_approx)
    let number = Option::<serde_json::Number>::deserialize(deserializer)?;
    Ok(number.and_then(|n| {
        n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f as u64)
        })
    }))
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_u64(deserializer)?.and_then(|v| u32::try_from(v).ok()))
}

/// Lifecycle phase of a task's progress stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressPhase {
    Started,
    Downloading,
    Transcoding,
    Finished,
    Failed,
}

impl ProgressPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Filtered progress event delivered to the consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: ProgressPhase,
    /// In [0, 1]; absent while progress is indeterminate
    pub fraction_complete: Option<f64>,
    pub transfer_rate_bytes_per_sec: Option<f64>,
    pub message: Option<String>,
}

impl ProgressEvent {
    pub fn new(phase: ProgressPhase) -> Self {
        Self {
            phase,
            fraction_complete: None,
            transfer_rate_bytes_per_sec: None,
            message: None,
        }
    }
}

/// Phase carried by a raw resolver callback
#[derive(Debug, Clone, PartialEq)]
pub enum RawPhase {
    Downloading,
    Transcoding,
    Finished,
    Error(String),
}

/// Unfiltered resolver callback: (phase, downloaded, total-or-null, rate-or-null)
#[derive(Debug, Clone, PartialEq)]
pub struct RawProgress {
    pub phase: RawPhase,
    pub downloaded: u64,
    /// May be absent, zero or non-finite when the host does not declare a size
    pub total: Option<f64>,
    pub rate: Option<f64>,
}

impl RawProgress {
    pub fn downloading(downloaded: u64, total: Option<f64>, rate: Option<f64>) -> Self {
        Self {
            phase: RawPhase::Downloading,
            downloaded,
            total,
            rate,
        }
    }

    pub fn transcoding() -> Self {
        Self {
            phase: RawPhase::Transcoding,
            downloaded: 0,
            total: None,
            rate: None,
        }
    }

    pub fn finished() -> Self {
        Self {
            phase: RawPhase::Finished,
            downloaded: 0,
            total: None,
            rate: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            phase: RawPhase::Error(message.into()),
            downloaded: 0,
            total: None,
            rate: None,
        }
    }
}

/// Audio extraction settings handed to the external transcoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTranscode {
    /// Target codec (mp3)
    pub codec: String,
    /// Target quality in kbps (192)
    pub quality: String,
    pub sample_rate: u32,
}

/// Everything a resolver needs to download one stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub url: String,
    pub format_id: String,
    pub destination: PathBuf,
    /// Present only for audio downloads
    pub transcode: Option<AudioTranscode>,
}
