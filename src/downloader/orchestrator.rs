// Downloader - consumer-facing facade over sessions and the task supervisor
//
// Workers post to the delivery queue; only `pump`/`next_delivery`/`settle`
// drain it, so every EventSink call happens in the consumer's context.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::runtime::Handle;

use super::config::EngineConfig;
use super::errors::{DownloadError, ErrorKind, Result};
use super::models::{SessionId, StreamKind, StreamRequest};
use super::session::Session;
use super::sink::{delivery_queue, DeliveryReceiver, Envelope, EventSink, TaskMessage};
use super::supervisor::{Operation, TaskHandle, TaskSupervisor};
use super::traits::Resolver;

pub struct Downloader<S: EventSink> {
    config: EngineConfig,
    supervisor: TaskSupervisor,
    sessions: HashMap<SessionId, Session>,
    deliveries: DeliveryReceiver,
    sink: S,
    next_session: u64,
}

impl<S: EventSink> Downloader<S> {
    /// Create an engine whose workers run on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside the context of a Tokio runtime.
    pub fn new(config: EngineConfig, resolver: Arc<dyn Resolver>, sink: S) -> Self {
        Self::with_runtime(config, resolver, sink, Handle::current())
    }

    /// Create an engine whose workers run on `runtime`
    pub fn with_runtime(
        config: EngineConfig,
        resolver: Arc<dyn Resolver>,
        sink: S,
        runtime: Handle,
    ) -> Self {
        let (tx, rx) = delivery_queue();
        let supervisor = TaskSupervisor::new(resolver, config.tracker.clone(), tx, runtime);

        Self {
            config,
            supervisor,
            sessions: HashMap::new(),
            deliveries: rx,
            sink,
            next_session: 1,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn create_session(&mut self) -> SessionId {
        let id = SessionId(self.next_session);
        self.next_session += 1;

        let session = Session::new(id, self.config.default_kind, self.config.download_dir.clone());
        self.sessions.insert(id, session);
        tracing::debug!(session_id = %id, "Session created");
        id
    }

    /// Submit a URL and start fetching its formats.
    ///
    /// A different URL than the session's current one resets the session
    /// (cancelling whatever it was doing) before the fetch starts. The same
    /// URL while a task is active fails with `AlreadyRunning`.
    pub fn submit_url(&mut self, id: SessionId, url: &str) -> Result<TaskHandle> {
        let url = url.trim();
        if url.is_empty() {
            return Err(DownloadError::InvalidUrl("URL is empty".to_string()));
        }

        let session = lookup(&mut self.sessions, id)?;

        if session.url() != Some(url) {
            if self.supervisor.cancel(session).is_some() {
                self.sink.on_session_state_changed(id, session.state());
            }
            let before = session.state();
            session.replace_url(url);
            if before != session.state() {
                self.sink.on_session_state_changed(id, session.state());
            }
            tracing::info!(session_id = %id, %url, "URL submitted");
        }

        let handle = self.supervisor.start(
            session,
            Operation::Fetch {
                url: url.to_string(),
            },
        )?;
        self.sink.on_session_state_changed(id, session.state());
        Ok(handle)
    }

    /// Switch the kind filter. Re-derives the catalog from cached metadata
    /// without a resolver call; with nothing cached only the filter changes.
    pub fn select_kind(&mut self, id: SessionId, kind: StreamKind) -> Result<()> {
        let session = lookup(&mut self.sessions, id)?;
        if session.kind() == kind {
            return Ok(());
        }

        if session.set_kind(kind) {
            tracing::debug!(session_id = %id, %kind, formats = session.catalog().len(), "Catalog re-derived");
            self.sink.on_catalog_updated(id, session.catalog());
        }
        Ok(())
    }

    pub fn select_format(&mut self, id: SessionId, format_id: &str) -> Result<()> {
        lookup(&mut self.sessions, id)?.select_format(format_id)
    }

    /// Override the download directory for one session
    pub fn set_destination(&mut self, id: SessionId, destination: impl Into<PathBuf>) -> Result<()> {
        lookup(&mut self.sessions, id)?.set_destination(destination.into());
        Ok(())
    }

    /// Download the selected format. Only valid from Ready with a selection.
    pub fn start_download(&mut self, id: SessionId) -> Result<TaskHandle> {
        let session = lookup(&mut self.sessions, id)?;
        if self.supervisor.is_running(session) {
            return Err(DownloadError::AlreadyRunning);
        }

        let format = session.downloadable_format()?;
        let transcode = match format.kind {
            StreamKind::Audio => Some(self.config.ytdlp.audio_transcode()),
            StreamKind::Video => None,
        };
        let url = session
            .download_url()
            .ok_or_else(|| DownloadError::InvalidSelection("session has no URL".to_string()))?;

        let request = StreamRequest {
            url: url.to_string(),
            format_id: format.id.clone(),
            destination: session.destination().to_path_buf(),
            transcode,
        };
        tracing::info!(
            session_id = %id,
            format_id = %request.format_id,
            label = %format.label(),
            "Download requested"
        );

        let handle = self.supervisor.start(session, Operation::Download { request })?;
        self.sink.on_session_state_changed(id, session.state());
        Ok(handle)
    }

    /// Cancel the session's active task. The session is back in its previous
    /// state when this returns. Returns false when nothing was running.
    pub fn cancel(&mut self, id: SessionId) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if self.supervisor.cancel(session).is_none() {
            return false;
        }
        self.sink.on_session_state_changed(id, session.state());
        true
    }

    /// Drop a session, cancelling anything it has in flight
    pub fn discard(&mut self, id: SessionId) -> bool {
        let Some(mut session) = self.sessions.remove(&id) else {
            return false;
        };
        self.supervisor.cancel(&mut session);
        tracing::debug!(session_id = %id, "Session discarded");
        true
    }

    /// Deliver everything already queued. Returns how many worker messages
    /// were taken off the queue (stale ones included).
    pub fn pump(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(envelope) = self.deliveries.try_recv() {
            self.apply(envelope);
            drained += 1;
        }
        drained
    }

    /// Wait for the next worker message and deliver it. Returns false when
    /// the message belonged to a cancelled task or discarded session.
    pub async fn next_delivery(&mut self) -> bool {
        match self.deliveries.recv().await {
            Some(envelope) => self.apply(envelope),
            None => false,
        }
    }

    /// Deliver messages until the session has no active task
    pub async fn settle(&mut self, id: SessionId) {
        while self
            .sessions
            .get(&id)
            .map_or(false, |s| s.active_task().is_some())
        {
            self.next_delivery().await;
        }
    }

    fn apply(&mut self, envelope: Envelope) -> bool {
        let Envelope {
            session: id,
            task,
            message,
        } = envelope;

        let Some(session) = self.sessions.get_mut(&id) else {
            tracing::debug!(session_id = %id, task_id = %task, "Dropping output for discarded session");
            return false;
        };
        if session.active_task().map(|h| h.id()) != Some(task) {
            tracing::warn!(session_id = %id, task_id = %task, "Discarding output of orphaned task");
            return false;
        }

        if message.is_terminal() {
            self.supervisor.complete(session, task);
        }

        match message {
            TaskMessage::Progress(event) => {
                self.sink.on_progress(id, &event);
            }
            TaskMessage::Fetched(metadata) => {
                session.apply_fetched(metadata);
                if session.catalog().is_empty() {
                    tracing::info!(
                        session_id = %id,
                        kind = %session.kind(),
                        error_kind = ?ErrorKind::NoMatchingFormats,
                        "No formats match the kind filter"
                    );
                }
                self.sink.on_catalog_updated(id, session.catalog());
                self.sink.on_session_state_changed(id, session.state());
            }
            TaskMessage::FetchFailed(error) => {
                session.apply_fetch_failed();
                report(&mut self.sink, id, &error);
                self.sink.on_session_state_changed(id, session.state());
            }
            TaskMessage::Finished(event) => {
                self.sink.on_progress(id, &event);
                session.apply_download_done();
                self.sink.on_session_state_changed(id, session.state());
            }
            TaskMessage::Failed(event, error) => {
                self.sink.on_progress(id, &event);
                report(&mut self.sink, id, &error);
                session.apply_download_done();
                self.sink.on_session_state_changed(id, session.state());
            }
        }
        true
    }
}

fn lookup(sessions: &mut HashMap<SessionId, Session>, id: SessionId) -> Result<&mut Session> {
    sessions
        .get_mut(&id)
        .ok_or_else(|| DownloadError::InvalidSelection(format!("unknown session {}", id)))
}

// Cancellation is a consumer transition, never an error report
fn report<S: EventSink>(sink: &mut S, id: SessionId, error: &DownloadError) {
    if error.kind() != ErrorKind::Cancelled {
        sink.on_error(id, error.kind(), &error.to_string());
    }
}
