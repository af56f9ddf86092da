use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::time::Instant;

use crate::detect::backend::{Detector, DetectorKind};
use crate::detect::backends::{build_detector, PoseEstimator};
use crate::detect::options::{ConfigMap, OptionSet};
use crate::detect::result::{DebugOverlay, DetectionResult};
use crate::frame::Frame;

/// Outcome of dispatching one frame.
#[derive(Clone, Debug)]
pub struct ProcessedFrame {
    pub result: DetectionResult,
    /// Wall-clock time spent inside the detector.
    pub elapsed: Duration,
    pub overlay: Option<DebugOverlay>,
    /// Detector that produced `result`, `None` when no detector was active.
    pub detector: Option<DetectorKind>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ManagerStats {
    pub frames_processed: u64,
    pub failures: u64,
    pub panics: u64,
    pub switches: u64,
    pub last_latency: Duration,
    pub total_latency: Duration,
}

impl ManagerStats {
    pub fn mean_latency(&self) -> Duration {
        if self.frames_processed == 0 {
            return Duration::ZERO;
        }
        self.total_latency / self.frames_processed as u32
    }
}

/// Owns the one live detector and dispatches frames to it.
///
/// `process` takes `&mut self`: whoever owns the manager can only have one detector call in
/// flight, and a switch cannot overlap a running `process`.
pub struct DetectorManager {
    active: Option<Box<dyn Detector>>,
    estimator: Arc<dyn PoseEstimator>,
    config: ConfigMap,
    overlays_enabled: bool,
    stats: ManagerStats,
}

impl DetectorManager {
    /// Manager with a `kind` detector already active.
    pub fn new(kind: DetectorKind, estimator: Arc<dyn PoseEstimator>) -> Self {
        let mut manager = Self::idle(estimator);
        manager.install(kind);
        manager
    }

    /// Manager with no active detector. Frames get a negative result until `switch_to`.
    pub fn idle(estimator: Arc<dyn PoseEstimator>) -> Self {
        Self {
            active: None,
            estimator,
            config: ConfigMap::new(),
            overlays_enabled: false,
            stats: ManagerStats::default(),
        }
    }

    pub fn active_kind(&self) -> Option<DetectorKind> {
        self.active.as_ref().map(|d| d.kind())
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats
    }

    /// The accumulated configuration map, re-applied on every switch.
    pub fn config(&self) -> &ConfigMap {
        &self.config
    }

    /// Hot-switch to `kind`. The old instance is released before the new one is built.
    ///
    /// Returns `false` when `kind` is already active (nothing is rebuilt).
    pub fn switch_to(&mut self, kind: DetectorKind) -> bool {
        if self.active_kind() == Some(kind) {
            log::debug!("detector {} already active", kind);
            return false;
        }
        let previous = self.active_kind();
        self.release();
        self.install(kind);
        self.stats.switches += 1;
        match previous {
            Some(previous) => log::info!("switched detector {} -> {}", previous, kind),
            None => log::info!("activated detector {}", kind),
        }
        true
    }

    fn install(&mut self, kind: DetectorKind) {
        let mut detector = build_detector(kind, &self.estimator);
        detector.set_overlay_enabled(self.overlays_enabled);
        if !self.config.is_empty() {
            detector.configure(&self.config);
        }
        self.active = Some(detector);
    }

    /// Merge `config` into the stored map and apply it to the active detector.
    pub fn configure(&mut self, config: &ConfigMap) {
        for (key, value) in config {
            self.config.insert(key.clone(), value.clone());
        }
        if let Some(detector) = self.active.as_mut() {
            detector.configure(config);
        }
    }

    /// Options of the active detector; empty when none is active.
    pub fn config_options(&self) -> OptionSet {
        self.active
            .as_ref()
            .map(|d| d.config_options())
            .unwrap_or_default()
    }

    pub fn set_overlays(&mut self, enabled: bool) {
        self.overlays_enabled = enabled;
        if let Some(detector) = self.active.as_mut() {
            detector.set_overlay_enabled(enabled);
        }
    }

    /// Clear the active detector's cross-frame state.
    pub fn reset(&mut self) {
        if let Some(detector) = self.active.as_mut() {
            detector.reset();
        }
    }

    /// Release and drop the active detector.
    pub fn release(&mut self) {
        if let Some(mut detector) = self.active.take() {
            detector.release();
            log::debug!("released detector {}", detector.kind());
        }
    }

    /// Run the active detector on `frame`.
    ///
    /// The frame is consumed: its release hook runs exactly once when this returns,
    /// whether the detector succeeded, failed, panicked, or was missing.
    pub async fn process(&mut self, frame: Frame) -> ProcessedFrame {
        let Some(detector) = self.active.as_mut() else {
            drop(frame);
            self.stats.failures += 1;
            return ProcessedFrame {
                result: DetectionResult::negative("no active detector"),
                elapsed: Duration::ZERO,
                overlay: None,
                detector: None,
            };
        };

        let kind = detector.kind();
        let started = Instant::now();
        let outcome = AssertUnwindSafe(detector.process(frame.sample()))
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();
        drop(frame);

        let (result, overlay) = match outcome {
            Ok(result) => (result, detector.take_overlay()),
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                log::warn!("detector {} panicked: {}; resetting", kind, reason);
                detector.reset();
                self.stats.panics += 1;
                (DetectionResult::failure(reason), None)
            }
        };

        self.stats.frames_processed += 1;
        self.stats.last_latency = elapsed;
        self.stats.total_latency += elapsed;
        if result.is_failure() {
            self.stats.failures += 1;
        }
        log::debug!(
            "{}: detected={} confidence={:.2} in {:?} ({})",
            kind,
            result.rider_detected,
            result.confidence,
            elapsed,
            result.debug_info
        );

        ProcessedFrame {
            result,
            elapsed,
            overlay,
            detector: Some(kind),
        }
    }
}

impl Drop for DetectorManager {
    fn drop(&mut self) {
        self.release();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "detector panicked".to_string()
    }
}
