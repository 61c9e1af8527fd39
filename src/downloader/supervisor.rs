// TaskSupervisor - runs fetch/download operations on background workers
//
// - at most one active task per session; `start` never queues
// - workers talk to the consumer only through the delivery queue
// - cancellation is cooperative: the session moves on immediately, the
//   worker is tagged Orphaned and its remaining output is dropped
// - every task posts exactly one terminal message, and only if not cancelled

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::config::TrackerConfig;
use super::errors::{DownloadError, Result};
use super::models::{
    ProgressEvent, ProgressPhase, RawProgress, SessionId, StreamRequest, TaskId,
};
use super::progress::ProgressTracker;
use super::session::{Session, SessionState};
use super::sink::{DeliverySender, Envelope, TaskMessage};
use super::traits::Resolver;

/// Work a task performs
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Fetch { url: String },
    Download { request: StreamRequest },
}

impl Operation {
    fn label(&self) -> &'static str {
        match self {
            Self::Fetch { .. } => "fetch",
            Self::Download { .. } => "download",
        }
    }

    /// Session state while this operation runs
    fn session_state(&self) -> SessionState {
        match self {
            Self::Fetch { .. } => SessionState::Fetching,
            Self::Download { .. } => SessionState::Downloading,
        }
    }
}

/// Supervisor-side bookkeeping state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Worker running, output is delivered
    Running,
    /// Cancelled by the consumer while the worker may still be running
    Orphaned,
    /// Terminal event delivered
    Completed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Orphaned => write!(f, "orphaned"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

struct TaskInner {
    id: TaskId,
    session: SessionId,
    operation: &'static str,
    cancel: CancellationToken,
    state: Mutex<TaskState>,
    /// Flips to true when the worker has exited
    done: watch::Sender<bool>,
}

/// Handle to one task. Cloning shares the same task.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    fn new(id: TaskId, session: SessionId, operation: &'static str) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(TaskInner {
                id,
                session,
                operation,
                cancel: CancellationToken::new(),
                state: Mutex::new(TaskState::Running),
                done,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn session(&self) -> SessionId {
        self.inner.session
    }

    pub fn state(&self) -> TaskState {
        *lock(&self.inner.state)
    }

    /// Raise the cooperative cancellation flag
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Whether the worker has exited
    pub fn is_done(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Wait until the worker has exited (including orphaned workers)
    pub async fn wait_done(&self) {
        let mut rx = self.inner.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    fn token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    fn set_state(&self, state: TaskState) {
        *lock(&self.inner.state) = state;
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("session", &self.inner.session)
            .field("operation", &self.inner.operation)
            .field("state", &self.state())
            .field("done", &self.is_done())
            .finish()
    }
}

const MIN_FLUSH_PERIOD: Duration = Duration::from_millis(10);

/// Live workers, keyed by task
type Registry = Arc<Mutex<HashMap<TaskId, TaskHandle>>>;

pub struct TaskSupervisor {
    resolver: Arc<dyn Resolver>,
    tracker: TrackerConfig,
    deliveries: DeliverySender,
    runtime: Handle,
    next_task: AtomicU64,
    workers: Registry,
}

impl TaskSupervisor {
    pub(crate) fn new(
        resolver: Arc<dyn Resolver>,
        tracker: TrackerConfig,
        deliveries: DeliverySender,
        runtime: Handle,
    ) -> Self {
        Self {
            resolver,
            tracker,
            deliveries,
            runtime,
            next_task: AtomicU64::new(1),
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a worker for `operation` on `session`.
    ///
    /// Fails with `AlreadyRunning` while the session has an active task.
    pub fn start(&self, session: &mut Session, operation: Operation) -> Result<TaskHandle> {
        if session.active_task().is_some() {
            return Err(DownloadError::AlreadyRunning);
        }

        let id = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed));
        let handle = TaskHandle::new(id, session.id(), operation.label());
        lock(&self.workers).insert(id, handle.clone());
        session.begin_task(handle.clone(), operation.session_state());

        tracing::info!(
            session_id = %session.id(),
            task_id = %id,
            operation = operation.label(),
            resolver = self.resolver.name(),
            "Starting task"
        );

        let worker = Worker {
            handle: handle.clone(),
            deliveries: self.deliveries.clone(),
            terminal_posted: AtomicBool::new(false),
            _guard: WorkerGuard {
                handle: handle.clone(),
                workers: Arc::clone(&self.workers),
            },
        };
        let resolver = Arc::clone(&self.resolver);

        match operation {
            Operation::Fetch { url } => {
                self.runtime.spawn(worker.fetch(resolver, url));
            }
            Operation::Download { request } => {
                let tracker = ProgressTracker::new(self.tracker.clone());
                self.runtime.spawn(worker.download(resolver, request, tracker));
            }
        }

        Ok(handle)
    }

    /// Cancel the session's active task. The session returns to the state that
    /// preceded the task before this returns; the worker is left to finish on
    /// its own and nothing it produces is delivered.
    pub fn cancel(&self, session: &mut Session) -> Option<TaskHandle> {
        let handle = session.abandon_task()?;
        handle.cancel();

        if handle.is_done() {
            handle.set_state(TaskState::Completed);
        } else {
            handle.set_state(TaskState::Orphaned);
        }

        tracing::info!(
            session_id = %session.id(),
            task_id = %handle.id(),
            task_state = %handle.state(),
            session_state = %session.state(),
            "Task cancelled"
        );
        Some(handle)
    }

    pub fn is_running(&self, session: &Session) -> bool {
        session.active_task().is_some()
    }

    /// Mark the session's active task complete after its terminal message
    /// has been taken off the delivery queue.
    pub(crate) fn complete(&self, session: &mut Session, task: TaskId) -> Option<TaskHandle> {
        let handle = session.take_task(task)?;
        handle.set_state(TaskState::Completed);
        Some(handle)
    }

    /// Workers that are still running (orphaned ones included)
    pub fn live_workers(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Cancelled workers that have not exited yet
    pub fn orphaned_count(&self) -> usize {
        lock(&self.workers)
            .values()
            .filter(|h| h.state() == TaskState::Orphaned)
            .count()
    }
}

impl fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("resolver", &self.resolver.name())
            .field("live_workers", &self.live_workers())
            .finish()
    }
}

/// Removes the worker from the registry and raises `done` however it exits
struct WorkerGuard {
    handle: TaskHandle,
    workers: Registry,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        lock(&self.workers).remove(&self.handle.id());
        if self.handle.state() == TaskState::Orphaned {
            tracing::debug!(task_id = %self.handle.id(), "Orphaned worker exited");
        }
        self.handle.inner.done.send_replace(true);
    }
}

struct Worker {
    handle: TaskHandle,
    deliveries: DeliverySender,
    terminal_posted: AtomicBool,
    _guard: WorkerGuard,
}

// A resolver that panics still owes the session a terminal message
impl Drop for Worker {
    fn drop(&mut self) {
        if self.terminal_posted.load(Ordering::Acquire) {
            return;
        }
        let error = DownloadError::NetworkError(format!(
            "{} worker exited without a result",
            self.handle.inner.operation
        ));
        tracing::warn!(task_id = %self.handle.id(), error = %error, "Worker aborted");
        let message = if self.handle.inner.operation == "fetch" {
            TaskMessage::FetchFailed(error)
        } else {
            TaskMessage::Failed(failed_event(&error), error)
        };
        self.post(message);
    }
}

impl Worker {
    /// Post a message unless the task was cancelled
    fn post(&self, message: TaskMessage) {
        if message.is_terminal() {
            self.terminal_posted.store(true, Ordering::Release);
        }
        if self.handle.is_cancelled() {
            tracing::debug!(
                task_id = %self.handle.id(),
                terminal = message.is_terminal(),
                "Discarding output of cancelled task"
            );
            return;
        }
        let envelope = Envelope {
            session: self.handle.session(),
            task: self.handle.id(),
            message,
        };
        if self.deliveries.send(envelope).is_err() {
            tracing::debug!(task_id = %self.handle.id(), "Delivery queue closed");
        }
    }

    async fn fetch(self, resolver: Arc<dyn Resolver>, url: String) {
        let result = resolver.probe(&url, self.handle.token()).await;

        match result {
            Ok(metadata) => {
                tracing::info!(
                    task_id = %self.handle.id(),
                    %url,
                    formats = metadata.formats.len(),
                    "Probe finished"
                );
                self.post(TaskMessage::Fetched(metadata));
            }
            Err(e) => {
                tracing::warn!(task_id = %self.handle.id(), %url, error = %e, "Probe failed");
                self.post(TaskMessage::FetchFailed(e));
            }
        }
    }

    async fn download(
        self,
        resolver: Arc<dyn Resolver>,
        request: StreamRequest,
        tracker: ProgressTracker,
    ) {
        let tracker = Mutex::new(tracker);
        // Terminal events from callbacks are held back until the resolver returns
        let held_terminal: Mutex<Option<ProgressEvent>> = Mutex::new(None);

        if let Some(started) = lock(&tracker).start() {
            self.post(TaskMessage::Progress(started));
        }

        let on_progress = |raw: RawProgress| {
            if self.handle.is_cancelled() {
                return;
            }
            let Some(event) = lock(&tracker).consume(raw) else {
                return;
            };
            if event.phase.is_terminal() {
                *lock(&held_terminal) = Some(event);
            } else {
                tracing::debug!(
                    task_id = %self.handle.id(),
                    phase = ?event.phase,
                    fraction = ?event.fraction_complete,
                    "Progress"
                );
                self.post(TaskMessage::Progress(event));
            }
        };

        // Coalesced updates are released on the window edge while the
        // resolver is quiet
        let window = lock(&tracker).coalesce_window().max(MIN_FLUSH_PERIOD);
        let mut flush = time::interval_at(time::Instant::now() + window, window);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let fetch = resolver.fetch_stream(&request, &on_progress, self.handle.token());
        tokio::pin!(fetch);
        let result = loop {
            tokio::select! {
                result = &mut fetch => break result,
                _ = flush.tick() => {
                    if self.handle.is_cancelled() {
                        continue;
                    }
                    let flushed = lock(&tracker).flush();
                    if let Some(event) = flushed {
                        self.post(TaskMessage::Progress(event));
                    }
                }
            }
        };

        let held = lock(&held_terminal).take();
        let message = match result {
            Ok(()) => match held {
                Some(event) if event.phase == ProgressPhase::Failed => {
                    let error = DownloadError::classify(event.message.as_deref().unwrap_or_default());
                    TaskMessage::Failed(event, error)
                }
                Some(event) => TaskMessage::Finished(event),
                None => {
                    let event = lock(&tracker)
                        .consume(RawProgress::finished())
                        .unwrap_or_else(|| finished_event());
                    TaskMessage::Finished(event)
                }
            },
            Err(error) => {
                let event = match held {
                    Some(event) if event.phase == ProgressPhase::Failed => event,
                    _ => lock(&tracker)
                        .consume(RawProgress::error(error.to_string()))
                        .unwrap_or_else(|| failed_event(&error)),
                };
                TaskMessage::Failed(event, error)
            }
        };

        match &message {
            TaskMessage::Failed(_, error) => tracing::warn!(
                task_id = %self.handle.id(),
                format_id = %request.format_id,
                error = %error,
                "Download failed"
            ),
            _ => tracing::info!(
                task_id = %self.handle.id(),
                format_id = %request.format_id,
                destination = %request.destination.display(),
                "Download finished"
            ),
        }

        self.post(message);
    }
}

fn finished_event() -> ProgressEvent {
    ProgressEvent {
        fraction_complete: Some(1.0),
        ..ProgressEvent::new(ProgressPhase::Finished)
    }
}

fn failed_event(error: &DownloadError) -> ProgressEvent {
    ProgressEvent {
        message: Some(error.to_string()),
        ..ProgressEvent::new(ProgressPhase::Failed)
    }
}

// A panicking sink or resolver must not wedge the supervisor
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
