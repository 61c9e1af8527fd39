// EventSink - the consumer side of the engine
//
// Workers never call the sink. They post envelopes onto the delivery queue,
// and the Downloader drains that queue from whatever context the consumer
// calls `pump`/`next_delivery` on. Sink calls are therefore serialized and
// never re-enter the engine.

use tokio::sync::mpsc;

use super::errors::{DownloadError, ErrorKind};
use super::format_catalog::FormatCatalog;
use super::models::{ProgressEvent, RawMetadata, SessionId, TaskId};
use super::session::SessionState;

/// Consumer-implemented receiver of engine updates. Implementations should
/// return quickly (UI-update latency, not I/O).
pub trait EventSink {
    /// A fetch finished or the kind filter changed. An empty catalog means
    /// "no formats of this kind", not a failure.
    fn on_catalog_updated(&mut self, session: SessionId, catalog: &FormatCatalog);

    fn on_progress(&mut self, session: SessionId, event: &ProgressEvent);

    fn on_session_state_changed(&mut self, session: SessionId, state: SessionState);

    fn on_error(&mut self, session: SessionId, kind: ErrorKind, message: &str);
}

/// Payload posted by a worker
#[derive(Debug)]
pub(crate) enum TaskMessage {
    Progress(ProgressEvent),
    Fetched(RawMetadata),
    FetchFailed(DownloadError),
    Finished(ProgressEvent),
    Failed(ProgressEvent, DownloadError),
}

impl TaskMessage {
    pub(crate) fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

#[derive(Debug)]
pub(crate) struct Envelope {
    pub session: SessionId,
    pub task: TaskId,
    pub message: TaskMessage,
}

pub(crate) type DeliverySender = mpsc::UnboundedSender<Envelope>;
pub(crate) type DeliveryReceiver = mpsc::UnboundedReceiver<Envelope>;

pub(crate) fn delivery_queue() -> (DeliverySender, DeliveryReceiver) {
    mpsc::unbounded_channel()
}
