pub mod downloader;

pub use downloader::{
    Downloader, DownloadError, EngineConfig, ErrorKind, EventSink, FormatCatalog, ProgressEvent,
    ProgressPhase, Resolver, SessionId, SessionState, StreamFormat, StreamKind, YtDlpResolver,
};
