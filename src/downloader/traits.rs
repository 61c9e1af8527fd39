// Resolver trait definition

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::errors::DownloadError;
use super::models::{RawMetadata, RawProgress, StreamRequest};

/// Raw progress callback handed to [`Resolver::fetch_stream`]
pub type ProgressCallback<'a> = dyn Fn(RawProgress) + Send + Sync + 'a;

/// External media resolver: turns URLs into metadata and streams into files
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Name of the resolver (for logging)
    fn name(&self) -> &'static str;

    /// Fetch stream metadata for a URL.
    ///
    /// Fails with `InvalidUrl`, `NetworkError` or `Unsupported`. `cancel` is
    /// advisory, as for [`fetch_stream`](Self::fetch_stream).
    async fn probe(&self, url: &str, cancel: &CancellationToken) -> Result<RawMetadata, DownloadError>;

    /// Download one stream, reporting raw progress through `progress`.
    ///
    /// `cancel` is advisory: implementations that can stop early should watch
    /// it, the caller never relies on them doing so. Fails with
    /// `NetworkError`, `TranscodeError` or `FilesystemError`.
    async fn fetch_stream(
        &self,
        request: &StreamRequest,
        progress: &ProgressCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError>;
}
