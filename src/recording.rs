//! Recording state machine.
//!
//! ```text
//! Idle -> Recording -> Saving -> Idle      (capture finalized)
//! Idle -> Recording -> Error  -> Idle      (capture failed)
//! ```
//!
//! `start()` is check-and-set under one mutex, so two near-simultaneous starts cannot both
//! pass the guard. Each start opens a numbered session; the spawned capture reports exactly
//! one terminal outcome for its session, and outcomes from a session that has since been
//! released are ignored. Saving/Error fall back to Idle after a delay that `release()` can
//! cancel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    #[default]
    Idle,
    Recording,
    Saving,
    Error(String),
}

/// Point-in-time copy of the controller, for the presence tracker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordingSnapshot {
    pub state: RecordingState,
    /// Set only while `state == Recording`.
    pub started_at: Option<Instant>,
    pub session: u64,
}

impl RecordingSnapshot {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.state == RecordingState::Idle
    }

    pub fn recording_started_at(&self) -> Option<Instant> {
        match self.state {
            RecordingState::Recording => self.started_at,
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordedClip {
    pub duration: Duration,
    pub location: Option<String>,
}

/// Capture backend. `record` runs until `stop` fires (or the sender is dropped), then
/// finalizes and reports exactly once.
#[async_trait]
pub trait RecordingBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn record(&self, stop: oneshot::Receiver<()>) -> Result<RecordedClip>;
}

/// Backend that only logs. Clips end on stop or after `max_length`.
#[derive(Clone, Debug)]
pub struct LoggingBackend {
    max_length: Duration,
}

impl LoggingBackend {
    pub fn new(max_length: Duration) -> Self {
        Self { max_length }
    }
}

impl Default for LoggingBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl RecordingBackend for LoggingBackend {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn record(&self, stop: oneshot::Receiver<()>) -> Result<RecordedClip> {
        let started = Instant::now();
        log::info!("recording: capture started");
        tokio::select! {
            _ = stop => {}
            _ = tokio::time::sleep(self.max_length) => {
                log::warn!("recording: clip hit maximum length {:?}", self.max_length);
            }
        }
        let duration = started.elapsed();
        log::info!("recording: capture finalized after {:?}", duration);
        Ok(RecordedClip {
            duration,
            location: None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Saving -> Idle delay.
    pub saving_reset: Duration,
    /// Error -> Idle delay.
    pub error_reset: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            saving_reset: Duration::from_secs(2),
            error_reset: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecordingEvent {
    Started { session: u64 },
    StopRequested { session: u64 },
    Saved { session: u64, clip: RecordedClip },
    Failed { session: u64, reason: String },
    /// Saving/Error auto-reset back to Idle.
    Ready { session: u64 },
    Released { session: u64 },
}

pub type EventSink = Arc<dyn Fn(RecordingEvent) + Send + Sync>;

#[derive(Default)]
struct Inner {
    state: RecordingState,
    session: u64,
    started_at: Option<Instant>,
    stop: Option<oneshot::Sender<()>>,
    auto_reset: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
    settings: ControllerSettings,
    sink: EventSink,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RecordingEvent) {
        (self.sink)(event);
    }
}

pub struct RecordingController {
    shared: Arc<Shared>,
    backend: Arc<dyn RecordingBackend>,
}

impl RecordingController {
    pub fn new(backend: Arc<dyn RecordingBackend>, settings: ControllerSettings, sink: EventSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                settings,
                sink,
            }),
            backend,
        }
    }

    /// Controller whose events are discarded.
    pub fn silent(backend: Arc<dyn RecordingBackend>, settings: ControllerSettings) -> Self {
        Self::new(backend, settings, Arc::new(|_| {}))
    }

    pub fn state(&self) -> RecordingState {
        self.shared.lock().state.clone()
    }

    pub fn snapshot(&self) -> RecordingSnapshot {
        let inner = self.shared.lock();
        RecordingSnapshot {
            state: inner.state.clone(),
            started_at: inner.started_at,
            session: inner.session,
        }
    }

    /// Begin a capture. Returns `false` without side effects unless the state is Idle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let session = {
            let mut inner = self.shared.lock();
            if inner.state != RecordingState::Idle {
                log::debug!("recording: start rejected in state {:?}", inner.state);
                return false;
            }
            inner.session += 1;
            inner.state = RecordingState::Recording;
            inner.started_at = Some(Instant::now());
            let (stop_tx, stop_rx) = oneshot::channel();
            inner.stop = Some(stop_tx);

            let shared = Arc::clone(&self.shared);
            let backend = Arc::clone(&self.backend);
            let session = inner.session;
            tokio::spawn(async move {
                let outcome = backend.record(stop_rx).await;
                finish(&shared, session, outcome);
            });
            session
        };
        log::info!("recording: session {} started ({})", session, self.backend.name());
        self.shared.emit(RecordingEvent::Started { session });
        true
    }

    /// Ask the active capture to finalize. A no-op when nothing is capturing.
    pub fn stop(&self) -> bool {
        let (sender, session) = {
            let mut inner = self.shared.lock();
            (inner.stop.take(), inner.session)
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(());
                log::info!("recording: session {} stop requested", session);
                self.shared.emit(RecordingEvent::StopRequested { session });
                true
            }
            None => {
                log::debug!("recording: stop ignored, no active capture");
                false
            }
        }
    }

    /// Stop immediately, cancel any pending auto-reset, and return to Idle.
    pub fn release(&self) {
        let session = {
            let mut inner = self.shared.lock();
            if let Some(handle) = inner.auto_reset.take() {
                handle.abort();
            }
            if let Some(sender) = inner.stop.take() {
                let _ = sender.send(());
            }
            let was_idle = inner.state == RecordingState::Idle;
            // Bump the session so a late terminal outcome is ignored.
            if !was_idle {
                inner.session += 1;
            }
            inner.state = RecordingState::Idle;
            inner.started_at = None;
            if was_idle {
                return;
            }
            inner.session
        };
        log::info!("recording: released");
        self.shared.emit(RecordingEvent::Released { session });
    }
}

impl Drop for RecordingController {
    fn drop(&mut self) {
        self.release();
    }
}

fn finish(shared: &Arc<Shared>, session: u64, outcome: Result<RecordedClip>) {
    let (event, delay) = {
        let mut inner = shared.lock();
        if inner.session != session || inner.state != RecordingState::Recording {
            log::debug!("recording: ignoring outcome of stale session {}", session);
            return;
        }
        inner.stop = None;
        inner.started_at = None;
        match outcome {
            Ok(clip) => {
                inner.state = RecordingState::Saving;
                log::info!("recording: session {} saved ({:?})", session, clip.duration);
                (RecordingEvent::Saved { session, clip }, shared.settings.saving_reset)
            }
            Err(err) => {
                let reason = format!("{:#}", err);
                log::warn!("recording: session {} failed: {}", session, reason);
                inner.state = RecordingState::Error(reason.clone());
                (RecordingEvent::Failed { session, reason }, shared.settings.error_reset)
            }
        }
    };
    shared.emit(event);

    let task_shared = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let ready = {
            let mut inner = task_shared.lock();
            let settled = matches!(inner.state, RecordingState::Saving | RecordingState::Error(_));
            if inner.session == session && settled {
                inner.state = RecordingState::Idle;
                inner.auto_reset = None;
                true
            } else {
                false
            }
        };
        if ready {
            log::debug!("recording: session {} back to idle", session);
            task_shared.emit(RecordingEvent::Ready { session });
        }
    });

    let mut inner = shared.lock();
    if inner.session == session {
        inner.auto_reset = Some(handle);
    } else {
        handle.abort();
    }
}

/// Backend that always fails; handy for exercising the error path.
#[derive(Clone, Debug)]
pub struct FailingBackend {
    reason: String,
}

impl FailingBackend {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl RecordingBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn record(&self, stop: oneshot::Receiver<()>) -> Result<RecordedClip> {
        let _ = stop.await;
        Err(anyhow!("{}", self.reason))
    }
}
