//! The serialized monitoring loop.
//!
//! One `Monitor` owns the detector manager, the presence tracker, and the recording
//! controller. Frames, commands, and detection results are all handled on the task that
//! runs `Monitor::run`, so presence and detector state never see concurrent mutation.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::detect::{
    ConfigMap, DebugOverlay, DetectionResult, DetectorKind, DetectorManager, PoseEstimator,
};
use crate::frame::{Frame, FrameSlot};
use crate::presence::{PresenceEdge, PresenceSettings, PresenceTracker, RecordingRequest};
use crate::recording::{
    ControllerSettings, EventSink, RecordingBackend, RecordingController, RecordingEvent,
    RecordingState,
};

/// Control messages accepted by a running monitor.
#[derive(Clone, Debug, PartialEq)]
pub enum MonitorCommand {
    SwitchDetector(DetectorKind),
    Configure(ConfigMap),
    SetOverlays(bool),
    /// Clear detector, presence, and recording state (e.g. the video source changed).
    Reset,
    Shutdown,
}

/// Everything observable that leaves the core.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    Detection {
        detector: Option<DetectorKind>,
        result: DetectionResult,
        elapsed_ms: f64,
    },
    Overlay { overlay: DebugOverlay },
    Presence { edge: PresenceEdge },
    Recording { event: RecordingEvent },
    DetectorSwitched { detector: DetectorKind },
}

pub struct Monitor {
    manager: DetectorManager,
    tracker: PresenceTracker,
    controller: RecordingController,
    events: mpsc::UnboundedSender<MonitorEvent>,
}

impl Monitor {
    pub fn new(
        manager: DetectorManager,
        presence: PresenceSettings,
        backend: Arc<dyn RecordingBackend>,
        recording: ControllerSettings,
    ) -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let recording_events = events.clone();
        let sink: EventSink = Arc::new(move |event| {
            let _ = recording_events.send(MonitorEvent::Recording { event });
        });
        let monitor = Self {
            manager,
            tracker: PresenceTracker::new(presence),
            controller: RecordingController::new(backend, recording, sink),
            events,
        };
        (monitor, receiver)
    }

    /// Convenience constructor: fresh manager running `kind`.
    pub fn with_detector(
        kind: DetectorKind,
        estimator: Arc<dyn PoseEstimator>,
        presence: PresenceSettings,
        backend: Arc<dyn RecordingBackend>,
        recording: ControllerSettings,
    ) -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        Self::new(DetectorManager::new(kind, estimator), presence, backend, recording)
    }

    pub fn manager(&self) -> &DetectorManager {
        &self.manager
    }

    pub fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    pub fn recording_state(&self) -> RecordingState {
        self.controller.state()
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }

    /// Process one frame end to end and return the detector's verdict.
    ///
    /// Presence thresholds are measured against the frame's capture instant, so detector
    /// latency does not stretch the cooldown or grace windows.
    pub async fn handle_frame(&mut self, frame: Frame) -> DetectionResult {
        let captured_at = frame.captured_at();
        let processed = self.manager.process(frame).await;

        self.emit(MonitorEvent::Detection {
            detector: processed.detector,
            result: processed.result.clone(),
            elapsed_ms: processed.elapsed.as_secs_f64() * 1000.0,
        });
        if let Some(overlay) = processed.overlay {
            self.emit(MonitorEvent::Overlay { overlay });
        }

        let snapshot = self.controller.snapshot();
        let update = self.tracker.observe(&processed.result, captured_at, &snapshot);
        if let Some(edge) = update.edge {
            log::info!("rider {:?} (confidence {:.2})", edge, processed.result.confidence);
            self.emit(MonitorEvent::Presence { edge });
        }
        match update.request {
            Some(RecordingRequest::Start) => {
                if !self.controller.start() {
                    log::warn!("recording start rejected in state {:?}", self.controller.state());
                }
            }
            Some(RecordingRequest::Stop(reason)) => {
                if self.controller.stop() {
                    log::info!("recording stop: {:?}", reason);
                }
            }
            None => {}
        }

        processed.result
    }

    /// Apply one command. Returns `false` when the monitor should shut down.
    pub fn handle_command(&mut self, command: MonitorCommand) -> bool {
        match command {
            MonitorCommand::SwitchDetector(kind) => {
                if self.manager.switch_to(kind) {
                    self.emit(MonitorEvent::DetectorSwitched { detector: kind });
                }
            }
            MonitorCommand::Configure(config) => self.manager.configure(&config),
            MonitorCommand::SetOverlays(enabled) => self.manager.set_overlays(enabled),
            MonitorCommand::Reset => self.reset(),
            MonitorCommand::Shutdown => return false,
        }
        true
    }

    /// Clear detector, presence, and recording state. A recording in progress is stopped
    /// and the controller returns to Idle.
    pub fn reset(&mut self) {
        log::info!("monitor reset");
        self.controller.release();
        self.manager.reset();
        self.tracker.reset();
    }

    /// Drive the monitor until the frame slot closes or `Shutdown` arrives.
    pub async fn run(
        mut self,
        slot: Arc<FrameSlot>,
        mut commands: mpsc::UnboundedReceiver<MonitorCommand>,
    ) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                biased;
                command = commands.recv(), if commands_open => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => commands_open = false,
                },
                frame = slot.next() => match frame {
                    Some(frame) => {
                        self.handle_frame(frame).await;
                    }
                    None => break,
                },
            }
        }
        self.shutdown(&slot);
    }

    fn shutdown(&mut self, slot: &FrameSlot) {
        slot.close();
        self.controller.release();
        self.manager.release();
        let stats = self.manager.stats();
        let slot_stats = slot.stats();
        log::info!(
            "monitor stopped: {} frames processed, {} failures, {} dropped, mean latency {:?}",
            stats.frames_processed,
            stats.failures,
            slot_stats.dropped,
            stats.mean_latency()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubPoseEstimator;
    use crate::frame::FrameSample;
    use crate::recording::LoggingBackend;
    use std::time::Duration;
    use tokio::time::Instant;

    fn monitor(kind: DetectorKind, estimator: StubPoseEstimator) -> (Monitor, mpsc::UnboundedReceiver<MonitorEvent>) {
        Monitor::with_detector(
            kind,
            Arc::new(estimator),
            PresenceSettings::default(),
            Arc::new(LoggingBackend::default()),
            ControllerSettings::default(),
        )
    }

    fn frame() -> Frame {
        Frame::new(FrameSample::from_packed_gray(vec![0u8; 32 * 24], 32, 24).unwrap())
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> Vec<MonitorEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn detection_starts_recording() {
        let (mut monitor, mut events) = monitor(DetectorKind::Pose, StubPoseEstimator::uniform(10, 0.9));
        let result = monitor.handle_frame(frame()).await;
        assert!(result.rider_detected);
        assert_eq!(monitor.recording_state(), RecordingState::Recording);

        let events = drain(&mut events);
        assert!(events.contains(&MonitorEvent::Presence { edge: PresenceEdge::Entered }));
        assert!(events.contains(&MonitorEvent::Recording {
            event: RecordingEvent::Started { session: 1 }
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn recording_stops_after_max_duration() {
        let (mut monitor, mut events) = monitor(DetectorKind::Pose, StubPoseEstimator::uniform(10, 0.9));
        monitor.handle_frame(frame()).await;
        tokio::time::sleep(Duration::from_millis(8001)).await;
        monitor.handle_frame(frame()).await;
        tokio::task::yield_now().await;

        let events = drain(&mut events);
        assert!(events.contains(&MonitorEvent::Recording {
            event: RecordingEvent::StopRequested { session: 1 }
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn switch_command_emits_event_once() {
        let (mut monitor, mut events) = monitor(DetectorKind::Motion, StubPoseEstimator::new());
        assert!(monitor.handle_command(MonitorCommand::SwitchDetector(DetectorKind::OpticalFlow)));
        assert!(monitor.handle_command(MonitorCommand::SwitchDetector(DetectorKind::OpticalFlow)));
        assert_eq!(
            drain(&mut events),
            vec![MonitorEvent::DetectorSwitched { detector: DetectorKind::OpticalFlow }]
        );
        assert!(!monitor.handle_command(MonitorCommand::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_presence() {
        let (mut monitor, _events) = monitor(DetectorKind::Pose, StubPoseEstimator::uniform(10, 0.9));
        monitor.handle_frame(frame()).await;
        assert!(monitor.tracker().state().is_present);
        monitor.handle_command(MonitorCommand::Reset);
        assert!(!monitor.tracker().state().is_present);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_ends_active_recording() {
        let (mut monitor, mut events) = monitor(DetectorKind::Motion, StubPoseEstimator::new());
        let blank = || Frame::new(FrameSample::from_packed_gray(vec![40u8; 640 * 480], 640, 480).unwrap());
        let block = || {
            let mut data = vec![40u8; 640 * 480];
            for y in 100..300 {
                for x in 100..300 {
                    data[y * 640 + x] = 220;
                }
            }
            Frame::new(FrameSample::from_packed_gray(data, 640, 480).unwrap())
        };

        monitor.handle_frame(blank()).await;
        assert!(monitor.handle_frame(block()).await.rider_detected);
        assert_eq!(monitor.recording_state(), RecordingState::Recording);

        assert!(monitor.handle_command(MonitorCommand::Reset));
        assert_eq!(monitor.recording_state(), RecordingState::Idle);
        assert!(!monitor.tracker().state().is_present);

        // The cancelled capture must not report back after the reset.
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            monitor.handle_frame(blank()).await;
        }
        assert_eq!(monitor.recording_state(), RecordingState::Idle);
        let recording: Vec<RecordingEvent> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                MonitorEvent::Recording { event } => Some(event),
                _ => None,
            })
            .collect();
        assert_eq!(
            recording,
            vec![
                RecordingEvent::Started { session: 1 },
                RecordingEvent::Released { session: 2 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn presence_uses_capture_instant() {
        let (mut monitor, _events) = monitor(DetectorKind::Pose, StubPoseEstimator::uniform(10, 0.9));
        let captured = Instant::now();
        tokio::time::sleep(Duration::from_millis(500)).await;
        monitor.handle_frame(frame().with_captured_at(captured)).await;
        assert_eq!(monitor.tracker().state().last_seen_at, Some(captured));
    }

    #[tokio::test(start_paused = true)]
    async fn run_exits_when_slot_closes() {
        let (monitor, _events) = monitor(DetectorKind::Motion, StubPoseEstimator::new());
        let slot = Arc::new(FrameSlot::new());
        let (_commands_tx, commands) = mpsc::unbounded_channel();
        slot.push(frame());
        slot.close();
        monitor.run(Arc::clone(&slot), commands).await;
    }
}
