// Session - per-interaction state machine
//
//   Idle -> Fetching -> Ready -> Downloading -> Ready
//   Fetching -> Idle        (fetch failed)
//   any -> Idle             (URL changed)
//
// Transitions happen only through TaskSupervisor outcomes and explicit
// consumer actions routed through the Downloader.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::errors::{DownloadError, Result};
use super::format_catalog::FormatCatalog;
use super::models::{RawMetadata, SessionId, StreamFormat, StreamKind, TaskId};
use super::supervisor::TaskHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Fetching,
    Ready,
    Downloading,
}

impl SessionState {
    /// Whether `self -> to` is an edge of the state machine
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (_, Idle)
                | (Idle, Fetching)
                | (Ready, Fetching)
                | (Fetching, Ready)
                | (Ready, Downloading)
                | (Downloading, Ready)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Fetching => write!(f, "fetching"),
            Self::Ready => write!(f, "ready"),
            Self::Downloading => write!(f, "downloading"),
        }
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    url: Option<String>,
    state: SessionState,
    kind: StreamKind,
    raw_metadata: Option<Arc<RawMetadata>>,
    catalog: FormatCatalog,
    selected_format_id: Option<String>,
    destination: PathBuf,
    active_task: Option<TaskHandle>,
    /// State to return to when the active task is cancelled
    resume_state: SessionState,
}

impl Session {
    pub fn new(id: SessionId, kind: StreamKind, destination: PathBuf) -> Self {
        Self {
            id,
            url: None,
            state: SessionState::Idle,
            kind,
            raw_metadata: None,
            catalog: FormatCatalog::empty(kind),
            selected_format_id: None,
            destination,
            active_task: None,
            resume_state: SessionState::Idle,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn raw_metadata(&self) -> Option<&RawMetadata> {
        self.raw_metadata.as_deref()
    }

    pub fn catalog(&self) -> &FormatCatalog {
        &self.catalog
    }

    pub fn selected_format_id(&self) -> Option<&str> {
        self.selected_format_id.as_deref()
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn active_task(&self) -> Option<&TaskHandle> {
        self.active_task.as_ref()
    }

    pub fn set_destination(&mut self, destination: PathBuf) {
        self.destination = destination;
    }

    /// Point the session at a new URL. Returns false when the URL is unchanged.
    ///
    /// The caller must have cancelled any active task first.
    pub(crate) fn replace_url(&mut self, url: &str) -> bool {
        if self.url.as_deref() == Some(url) {
            return false;
        }
        self.url = Some(url.to_string());
        self.raw_metadata = None;
        self.catalog = FormatCatalog::empty(self.kind);
        self.selected_format_id = None;
        self.set_state(SessionState::Idle);
        true
    }

    pub(crate) fn begin_task(&mut self, handle: TaskHandle, next: SessionState) {
        self.resume_state = self.state;
        self.active_task = Some(handle);
        self.set_state(next);
    }

    /// Detach the active task if it is `task`
    pub(crate) fn take_task(&mut self, task: TaskId) -> Option<TaskHandle> {
        match &self.active_task {
            Some(handle) if handle.id() == task => self.active_task.take(),
            _ => None,
        }
    }

    /// Detach the active task and return to the state that preceded it
    pub(crate) fn abandon_task(&mut self) -> Option<TaskHandle> {
        let handle = self.active_task.take()?;
        self.set_state(self.resume_state);
        Some(handle)
    }

    pub(crate) fn apply_fetched(&mut self, metadata: RawMetadata) {
        self.raw_metadata = Some(Arc::new(metadata));
        self.rederive();
        self.set_state(SessionState::Ready);
    }

    pub(crate) fn apply_fetch_failed(&mut self) {
        self.set_state(SessionState::Idle);
    }

    pub(crate) fn apply_download_done(&mut self) {
        self.set_state(SessionState::Ready);
    }

    /// Change the kind filter. Returns true when the catalog was re-derived
    /// from cached metadata.
    pub(crate) fn set_kind(&mut self, kind: StreamKind) -> bool {
        self.kind = kind;
        if self.raw_metadata.is_none() {
            return false;
        }
        self.rederive();
        true
    }

    pub(crate) fn select_format(&mut self, format_id: &str) -> Result<()> {
        if !self.catalog.contains(format_id) {
            return Err(DownloadError::InvalidSelection(format!(
                "format {} is not in the current {} catalog",
                format_id, self.kind
            )));
        }
        self.selected_format_id = Some(format_id.to_string());
        Ok(())
    }

    /// The selected format, if a download may start right now
    pub(crate) fn downloadable_format(&self) -> Result<&StreamFormat> {
        if self.state != SessionState::Ready {
            return Err(DownloadError::InvalidSelection(format!(
                "session is {}, formats must be fetched first",
                self.state
            )));
        }
        let selected = self
            .selected_format_id
            .as_deref()
            .ok_or_else(|| DownloadError::InvalidSelection("no format selected".to_string()))?;
        self.catalog.get(selected).ok_or_else(|| {
            DownloadError::InvalidSelection(format!("format {} is no longer available", selected))
        })
    }

    /// URL to hand the resolver for downloads
    pub(crate) fn download_url(&self) -> Option<&str> {
        self.raw_metadata
            .as_ref()
            .and_then(|m| m.webpage_url.as_deref())
            .filter(|u| !u.is_empty())
            .or(self.url.as_deref())
    }

    fn rederive(&mut self) {
        if let Some(metadata) = &self.raw_metadata {
            self.catalog = FormatCatalog::derive(metadata, self.kind);
        }
        if let Some(selected) = &self.selected_format_id {
            if !self.catalog.contains(selected) {
                self.selected_format_id = None;
            }
        }
    }

    fn set_state(&mut self, next: SessionState) {
        debug_assert!(
            self.state == next || self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }
}
