// Downloader module - fetch/download orchestration engine
//
// FormatCatalog and ProgressTracker are pure; TaskSupervisor runs resolver
// calls on Tokio tasks; Downloader is the facade the consumer drives.

pub mod backends;
pub mod config;
pub mod errors;
pub mod format_catalog;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod session;
pub mod sink;
pub mod supervisor;
pub mod tools;
pub mod traits;
pub mod utils;

#[cfg(test)]
mod test_helpers;

pub use backends::YtDlpResolver;
pub use config::{EngineConfig, TrackerConfig, YtDlpConfig};
pub use errors::{DownloadError, ErrorKind, Result};
pub use format_catalog::FormatCatalog;
pub use models::{
    AudioTranscode, ProgressEvent, ProgressPhase, RawMetadata, RawProgress, SessionId,
    SizeEstimate, StreamFormat, StreamKind, StreamRequest, TaskId,
};
pub use orchestrator::Downloader;
pub use progress::ProgressTracker;
pub use session::{Session, SessionState};
pub use sink::EventSink;
pub use supervisor::{Operation, TaskHandle, TaskState, TaskSupervisor};
pub use traits::{ProgressCallback, Resolver};
