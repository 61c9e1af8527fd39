// Shared fixtures for engine tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::errors::{DownloadError, ErrorKind};
use super::format_catalog::FormatCatalog;
use super::models::{
    ProgressEvent, RawFormat, RawMetadata, RawProgress, SessionId, StreamRequest,
};
use super::session::SessionState;
use super::sink::EventSink;
use super::traits::{ProgressCallback, Resolver};

/// Resolver driven by the test. When gated, every probe/fetch waits for one
/// `release()` before it runs. The scripted progress and the returned result
/// are set independently, so callbacks may contradict the outcome.
pub struct ScriptedResolver {
    gate: Option<Semaphore>,
    metadata: Mutex<std::result::Result<RawMetadata, DownloadError>>,
    progress: Mutex<Vec<RawProgress>>,
    fetch_result: Mutex<std::result::Result<(), DownloadError>>,
    last_request: Mutex<Option<StreamRequest>>,
    /// Sleep between the last progress callback and returning
    linger: Mutex<Option<Duration>>,
    panics: AtomicBool,
    probes: AtomicUsize,
    fetches: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new(metadata: RawMetadata) -> Self {
        Self {
            gate: None,
            metadata: Mutex::new(Ok(metadata)),
            progress: Mutex::new(Vec::new()),
            fetch_result: Mutex::new(Ok(())),
            last_request: Mutex::new(None),
            linger: Mutex::new(None),
            panics: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn gated(metadata: RawMetadata) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new(metadata)
        }
    }

    /// Let one gated call proceed
    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn fail_probe(&self, error: DownloadError) {
        *self.metadata.lock().unwrap() = Err(error);
    }

    pub fn script_progress(&self, events: Vec<RawProgress>) {
        *self.progress.lock().unwrap() = events;
    }

    pub fn fail_fetch(&self, error: DownloadError) {
        *self.fetch_result.lock().unwrap() = Err(error);
    }

    pub fn linger(&self, pause: Duration) {
        *self.linger.lock().unwrap() = Some(pause);
    }

    /// Every later call panics once past the gate
    pub fn panic_on_call(&self) {
        self.panics.store(true, Ordering::SeqCst);
    }

    pub fn probe_calls(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<StreamRequest> {
        self.last_request.lock().unwrap().clone()
    }

    async fn pass_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.panics.load(Ordering::SeqCst) {
            panic!("scripted resolver failure");
        }
    }
}

#[async_trait]
impl Resolver for ScriptedResolver {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn probe(&self, _url: &str, _cancel: &CancellationToken) -> Result<RawMetadata, DownloadError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        self.metadata.lock().unwrap().clone()
    }

    async fn fetch_stream(
        &self,
        request: &StreamRequest,
        progress: &ProgressCallback<'_>,
        _cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        self.pass_gate().await;

        let events = self.progress.lock().unwrap().clone();
        for event in events {
            progress(event);
        }
        let linger = *self.linger.lock().unwrap();
        if let Some(pause) = linger {
            tokio::time::sleep(pause).await;
        }
        self.fetch_result.lock().unwrap().clone()
    }
}

/// Everything a sink saw, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Catalog(SessionId, Vec<String>),
    Progress(SessionId, ProgressEvent),
    State(SessionId, SessionState),
    Error(SessionId, ErrorKind, String),
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub calls: Vec<SinkCall>,
}

impl RecordingSink {
    pub fn states(&self) -> Vec<SessionState> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                SinkCall::State(_, s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub fn progress(&self) -> Vec<ProgressEvent> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                SinkCall::Progress(_, e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<ErrorKind> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                SinkCall::Error(_, k, _) => Some(*k),
                _ => None,
            })
            .collect()
    }

    pub fn catalogs(&self) -> Vec<Vec<String>> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                SinkCall::Catalog(_, ids) => Some(ids.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn on_catalog_updated(&mut self, session: SessionId, catalog: &FormatCatalog) {
        let ids = catalog.formats().iter().map(|f| f.id.clone()).collect();
        self.calls.push(SinkCall::Catalog(session, ids));
    }

    fn on_progress(&mut self, session: SessionId, event: &ProgressEvent) {
        self.calls.push(SinkCall::Progress(session, event.clone()));
    }

    fn on_session_state_changed(&mut self, session: SessionId, state: SessionState) {
        self.calls.push(SinkCall::State(session, state));
    }

    fn on_error(&mut self, session: SessionId, kind: ErrorKind, message: &str) {
        self.calls.push(SinkCall::Error(session, kind, message.to_string()));
    }
}

/// One muxed 720p mp4, one muxed 360p mp4 and one audio-only m4a
pub fn sample_metadata() -> RawMetadata {
    RawMetadata {
        id: "abc".to_string(),
        title: "Sample clip".to_string(),
        webpage_url: Some("https://www.youtube.com/watch?v=abc".to_string()),
        formats: vec![
            RawFormat {
                format_id: "18".to_string(),
                ext: "mp4".to_string(),
                height: Some(360),
                vcodec: Some("avc1.42001E".to_string()),
                acodec: Some("mp4a.40.2".to_string()),
                filesize: Some(5_000_000),
                ..Default::default()
            },
            RawFormat {
                format_id: "22".to_string(),
                ext: "mp4".to_string(),
                height: Some(720),
                fps: Some(30.0),
                vcodec: Some("avc1.64001F".to_string()),
                acodec: Some("mp4a.40.2".to_string()),
                filesize_approx: Some(20_000_000),
                ..Default::default()
            },
            RawFormat {
                format_id: "140".to_string(),
                ext: "m4a".to_string(),
                vcodec: Some("none".to_string()),
                acodec: Some("mp4a.40.2".to_string()),
                abr: Some(129.5),
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}
