//! Rider presence tracking.
//!
//! `PresenceTracker` turns a stream of detection results into enter/leave edges and
//! recording start/stop requests. All thresholds are wall-clock durations measured
//! between result timestamps: frames may be dropped upstream, so frame counts mean nothing.
//!
//! The tracker is plain data with no locks. It is owned by the monitor task, which feeds
//! it one result at a time.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::detect::DetectionResult;
use crate::recording::RecordingSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresenceSettings {
    /// Minimum interval between two start attempts (debounces detector flicker).
    pub recording_cooldown: Duration,
    /// Hard cap on one recording.
    pub recording_duration: Duration,
    /// Grace window after the rider leaves before recording stops.
    pub post_rider_delay: Duration,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            recording_cooldown: Duration::from_millis(1000),
            recording_duration: Duration::from_millis(8000),
            post_rider_delay: Duration::from_millis(2000),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PresenceState {
    pub is_present: bool,
    pub last_seen_at: Option<Instant>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEdge {
    Entered,
    Left,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    DurationElapsed,
    RiderGone,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingRequest {
    Start,
    Stop(StopReason),
}

/// What one observation changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub edge: Option<PresenceEdge>,
    pub request: Option<RecordingRequest>,
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    settings: PresenceSettings,
    state: PresenceState,
    last_start_attempt: Option<Instant>,
}

impl PresenceTracker {
    pub fn new(settings: PresenceSettings) -> Self {
        Self {
            settings,
            state: PresenceState::default(),
            last_start_attempt: None,
        }
    }

    pub fn settings(&self) -> &PresenceSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: PresenceSettings) {
        self.settings = settings;
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    /// Feed one detection result observed at `now`.
    pub fn observe(
        &mut self,
        result: &DetectionResult,
        now: Instant,
        recording: &RecordingSnapshot,
    ) -> PresenceUpdate {
        let mut update = PresenceUpdate::default();

        if result.rider_detected {
            self.state.last_seen_at = Some(now);
            if !self.state.is_present {
                self.state.is_present = true;
                update.edge = Some(PresenceEdge::Entered);
                if recording.is_idle() {
                    if self.cooldown_elapsed(now) {
                        self.last_start_attempt = Some(now);
                        update.request = Some(RecordingRequest::Start);
                    } else {
                        log::warn!("rider entered within recording cooldown; start suppressed");
                    }
                }
            }
        } else if self.state.is_present {
            self.state.is_present = false;
            update.edge = Some(PresenceEdge::Left);
        }

        if let Some(started_at) = recording.recording_started_at() {
            let since_start = now.saturating_duration_since(started_at);
            let since_seen = self
                .state
                .last_seen_at
                .map(|seen| now.saturating_duration_since(seen));
            if since_start > self.settings.recording_duration {
                update.request = Some(RecordingRequest::Stop(StopReason::DurationElapsed));
            } else if !self.state.is_present
                && since_seen.is_some_and(|d| d > self.settings.post_rider_delay)
            {
                update.request = Some(RecordingRequest::Stop(StopReason::RiderGone));
            }
        }

        update
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.last_start_attempt
            .map_or(true, |last| now.saturating_duration_since(last) > self.settings.recording_cooldown)
    }

    /// Forget presence history (e.g. on video switch).
    pub fn reset(&mut self) {
        self.state = PresenceState::default();
        self.last_start_attempt = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{RecordingSnapshot, RecordingState};

    fn seen() -> DetectionResult {
        DetectionResult::new(true, 0.9, "rider")
    }

    fn empty() -> DetectionResult {
        DetectionResult::negative("nothing")
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn recording_since(at: Instant) -> RecordingSnapshot {
        RecordingSnapshot {
            state: RecordingState::Recording,
            started_at: Some(at),
            session: 1,
        }
    }

    #[test]
    fn enter_edge_requests_start_when_idle() {
        let mut tracker = PresenceTracker::default();
        let t0 = Instant::now();
        let update = tracker.observe(&seen(), t0, &RecordingSnapshot::idle());
        assert_eq!(update.edge, Some(PresenceEdge::Entered));
        assert_eq!(update.request, Some(RecordingRequest::Start));
        assert!(tracker.state().is_present);

        let update = tracker.observe(&seen(), t0 + ms(30), &RecordingSnapshot::idle());
        assert_eq!(update, PresenceUpdate::default());
        assert_eq!(tracker.state().last_seen_at, Some(t0 + ms(30)));
    }

    #[test]
    fn cooldown_debounces_flicker() {
        let mut tracker = PresenceTracker::default();
        let idle = RecordingSnapshot::idle();
        let t0 = Instant::now();

        let first = tracker.observe(&seen(), t0, &idle);
        assert_eq!(first.request, Some(RecordingRequest::Start));
        tracker.observe(&empty(), t0 + ms(200), &idle);

        let second = tracker.observe(&seen(), t0 + ms(400), &idle);
        assert_eq!(second.edge, Some(PresenceEdge::Entered));
        assert_eq!(second.request, None);
        tracker.observe(&empty(), t0 + ms(800), &idle);

        let third = tracker.observe(&seen(), t0 + ms(1200), &idle);
        assert_eq!(third.request, Some(RecordingRequest::Start));
    }

    #[test]
    fn no_start_while_controller_busy() {
        let mut tracker = PresenceTracker::default();
        let t0 = Instant::now();
        let saving = RecordingSnapshot {
            state: RecordingState::Saving,
            started_at: None,
            session: 3,
        };
        let update = tracker.observe(&seen(), t0, &saving);
        assert_eq!(update.edge, Some(PresenceEdge::Entered));
        assert_eq!(update.request, None);
    }

    #[test]
    fn leaving_does_not_stop_immediately() {
        let mut tracker = PresenceTracker::default();
        let t0 = Instant::now();
        tracker.observe(&seen(), t0, &RecordingSnapshot::idle());
        let update = tracker.observe(&empty(), t0 + ms(100), &recording_since(t0));
        assert_eq!(update.edge, Some(PresenceEdge::Left));
        assert_eq!(update.request, None);
    }

    #[test]
    fn duration_boundary_is_strict() {
        let mut tracker = PresenceTracker::default();
        let t0 = Instant::now();
        let recording = recording_since(t0);
        tracker.observe(&seen(), t0, &RecordingSnapshot::idle());

        let at_limit = tracker.observe(&seen(), t0 + ms(8000), &recording);
        assert_eq!(at_limit.request, None);
        let past_limit = tracker.observe(&seen(), t0 + ms(8001), &recording);
        assert_eq!(
            past_limit.request,
            Some(RecordingRequest::Stop(StopReason::DurationElapsed))
        );
    }

    #[test]
    fn post_rider_delay_boundary_is_strict() {
        let mut tracker = PresenceTracker::default();
        let t0 = Instant::now();
        let recording = recording_since(t0);
        tracker.observe(&seen(), t0, &RecordingSnapshot::idle());
        tracker.observe(&seen(), t0 + ms(1000), &recording);
        tracker.observe(&empty(), t0 + ms(1500), &recording);

        let at_limit = tracker.observe(&empty(), t0 + ms(3000), &recording);
        assert_eq!(at_limit.request, None);
        let past_limit = tracker.observe(&empty(), t0 + ms(3001), &recording);
        assert_eq!(past_limit.request, Some(RecordingRequest::Stop(StopReason::RiderGone)));
    }

    #[test]
    fn irregular_spacing_uses_timestamps() {
        let mut tracker = PresenceTracker::default();
        let t0 = Instant::now();
        let recording = recording_since(t0);
        tracker.observe(&seen(), t0, &RecordingSnapshot::idle());
        // A single late frame well after the grace window stops immediately.
        let update = tracker.observe(&empty(), t0 + ms(5000), &recording);
        assert_eq!(update.edge, Some(PresenceEdge::Left));
        assert_eq!(update.request, Some(RecordingRequest::Stop(StopReason::RiderGone)));
    }

    #[test]
    fn reset_clears_presence_and_cooldown() {
        let mut tracker = PresenceTracker::default();
        let t0 = Instant::now();
        tracker.observe(&seen(), t0, &RecordingSnapshot::idle());
        tracker.reset();
        assert_eq!(tracker.state(), PresenceState::default());
        let update = tracker.observe(&seen(), t0 + ms(10), &RecordingSnapshot::idle());
        assert_eq!(update.request, Some(RecordingRequest::Start));
    }
}
