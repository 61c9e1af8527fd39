// Error types for the fetch/download engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Appended to every transcoder failure so the consumer can show a fix.
pub const TRANSCODER_HINT: &str = "FFmpeg is required for audio conversion. \
     Install it and make sure it is on your PATH (https://ffmpeg.org/download.html).";

/// Attached when the resolver executable cannot be started.
pub const RESOLVER_HINT: &str = "yt-dlp is required to resolve media URLs. \
     Install it (https://github.com/yt-dlp/yt-dlp#installation) or set `ytdlp.binary` in the config.";

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Flat error classification reported to the EventSink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidUrl,
    NetworkError,
    Unsupported,
    /// Not a failure: a fetch succeeded but no format matched the kind filter
    NoMatchingFormats,
    AlreadyRunning,
    InvalidSelection,
    TranscodeError,
    FilesystemError,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DownloadError {
    /// URL is malformed or empty
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Connection, timeout or HTTP failure while talking to the media host
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The resolver cannot interpret this URL
    #[error("Unsupported URL: {0}")]
    Unsupported(String),

    /// The session already has a task in flight
    #[error("An operation is already running for this session")]
    AlreadyRunning,

    /// Download requested without a valid selected format
    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    /// External transcoder missing or failed
    #[error("Transcode error: {0}\n\n{hint}", hint = TRANSCODER_HINT)]
    TranscodeError(String),

    /// Destination could not be written
    #[error("Filesystem error: {0}")]
    FilesystemError(String),

    /// Task was cancelled by the consumer
    #[error("Cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUrl(_) => ErrorKind::InvalidUrl,
            Self::NetworkError(_) => ErrorKind::NetworkError,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::AlreadyRunning => ErrorKind::AlreadyRunning,
            Self::InvalidSelection(_) => ErrorKind::InvalidSelection,
            Self::TranscodeError(_) => ErrorKind::TranscodeError,
            Self::FilesystemError(_) => ErrorKind::FilesystemError,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Classify raw resolver output (usually yt-dlp stderr) into the taxonomy.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();

        // Transcoder problems first: yt-dlp mentions ffmpeg in most postprocessor errors
        if lower.contains("ffmpeg")
            || lower.contains("ffprobe")
            || lower.contains("postprocessing")
            || lower.contains("audio conversion failed")
        {
            return Self::TranscodeError(message.trim().to_string());
        }

        if lower.contains("unsupported url") || lower.contains("no suitable extractor") {
            return Self::Unsupported(message.trim().to_string());
        }

        if lower.contains("is not a valid url")
            || lower.contains("invalid url")
            || lower.contains("incomplete youtube id")
        {
            return Self::InvalidUrl(message.trim().to_string());
        }

        if lower.contains("permission denied")
            || lower.contains("no space left")
            || lower.contains("read-only file system")
            || lower.contains("unable to open for writing")
            || lower.contains("unable to create directory")
        {
            return Self::FilesystemError(message.trim().to_string());
        }

        // Timeouts, HTTP errors, DNS and anything else the host side produced
        Self::NetworkError(message.trim().to_string())
    }
}

// Resolver backends mostly hand us stderr text
impl From<String> for DownloadError {
    fn from(s: String) -> Self {
        Self::classify(&s)
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        Self::FilesystemError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcode_detection() {
        let err = DownloadError::classify("ERROR: Postprocessing: ffprobe and ffmpeg not found");
        assert_eq!(err.kind(), ErrorKind::TranscodeError);
        assert!(err.to_string().contains("FFmpeg is required"));
    }

    #[test]
    fn test_unsupported_detection() {
        let err = DownloadError::from("ERROR: Unsupported URL: https://example.com/".to_string());
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_invalid_url_detection() {
        let err = DownloadError::classify("ERROR: 'abc' is not a valid URL");
        assert_eq!(err.kind(), ErrorKind::InvalidUrl);
    }

    #[test]
    fn test_filesystem_detection() {
        let err = DownloadError::classify("ERROR: unable to open for writing: [Errno 13] Permission denied");
        assert_eq!(err.kind(), ErrorKind::FilesystemError);
    }

    #[test]
    fn test_network_is_fallback() {
        let err = DownloadError::classify("ERROR: Unable to download webpage: HTTP Error 403: Forbidden");
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        let err = DownloadError::classify("Timed out after 30s");
        assert_eq!(err.kind(), ErrorKind::NetworkError);
    }

    #[test]
    fn test_io_error_maps_to_filesystem() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(DownloadError::from(io).kind(), ErrorKind::FilesystemError);
    }
}
