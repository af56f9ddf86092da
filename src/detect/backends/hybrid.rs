use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::detect::backend::{Detector, DetectorKind};
use crate::detect::options::{
    insert, read_bool, read_f64, ConfigMap, ConfigOption, OptionSet,
};
use crate::detect::result::{DebugOverlay, DetectionResult};
use crate::frame::FrameSample;

use super::motion::MotionDetector;
use super::pose::{PoseDetector, PoseEstimator};

pub const POSE_WEIGHT: &str = "pose_weight";
pub const MOTION_WEIGHT: &str = "motion_weight";
pub const COMBINED_THRESHOLD: &str = "combined_threshold";
pub const REQUIRE_BOTH: &str = "require_both";

pub const POSE_PREFIX: &str = "pose_";
pub const MOTION_PREFIX: &str = "motion_";

#[derive(Clone, Debug, PartialEq)]
pub struct HybridSettings {
    pub pose_weight: f64,
    pub motion_weight: f64,
    pub combined_threshold: f64,
    /// When set, both children must detect; the weighted score is informational only.
    pub require_both: bool,
}

impl Default for HybridSettings {
    fn default() -> Self {
        Self {
            pose_weight: 0.7,
            motion_weight: 0.3,
            combined_threshold: 0.4,
            require_both: false,
        }
    }
}

impl HybridSettings {
    pub fn options() -> OptionSet {
        let d = Self::default();
        let mut options = OptionSet::new();
        insert(&mut options, ConfigOption::float(POSE_WEIGHT, "Pose weight", d.pose_weight, 0.0, 1.0));
        insert(&mut options, ConfigOption::float(MOTION_WEIGHT, "Motion weight", d.motion_weight, 0.0, 1.0));
        insert(
            &mut options,
            ConfigOption::float(COMBINED_THRESHOLD, "Combined threshold", d.combined_threshold, 0.0, 1.0),
        );
        insert(&mut options, ConfigOption::bool(REQUIRE_BOTH, "Require both detectors", d.require_both));
        options
    }

    pub fn apply(&mut self, config: &ConfigMap) {
        let options = Self::options();
        if let Some(v) = read_f64(&options, config, POSE_WEIGHT) {
            self.pose_weight = v;
        }
        if let Some(v) = read_f64(&options, config, MOTION_WEIGHT) {
            self.motion_weight = v;
        }
        if let Some(v) = read_f64(&options, config, COMBINED_THRESHOLD) {
            self.combined_threshold = v;
        }
        if let Some(v) = read_bool(&options, config, REQUIRE_BOTH) {
            self.require_both = v;
        }
    }
}

/// Per-frame view of how the hybrid reached its decision.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HybridBreakdown {
    pub pose: DetectionResult,
    pub motion: DetectionResult,
    /// Weighted sum before clamping. Can exceed 1.0 when the weights do.
    pub combined_confidence: f64,
}

/// Fuse two child results.
pub fn combine(
    settings: &HybridSettings,
    pose: &DetectionResult,
    motion: &DetectionResult,
) -> (DetectionResult, f64) {
    let combined = pose.confidence * settings.pose_weight + motion.confidence * settings.motion_weight;
    let rider_detected = if settings.require_both {
        pose.rider_detected && motion.rider_detected
    } else {
        combined > settings.combined_threshold
    };
    let result = DetectionResult::new(
        rider_detected,
        combined,
        format!(
            "combined {:.2} (pose {:.2}{}, motion {:.2}{}){}",
            combined,
            pose.confidence,
            if pose.rider_detected { "+" } else { "" },
            motion.confidence,
            if motion.rider_detected { "+" } else { "" },
            if settings.require_both { " require both" } else { "" },
        ),
    );
    (result, combined)
}

/// Runs motion and pose on the same frame and fuses the two confidences.
pub struct HybridDetector {
    motion: MotionDetector,
    pose: PoseDetector,
    settings: HybridSettings,
    last: Option<HybridBreakdown>,
}

impl HybridDetector {
    pub fn new(estimator: Arc<dyn PoseEstimator>) -> Self {
        Self {
            motion: MotionDetector::new(),
            pose: PoseDetector::new(estimator),
            settings: HybridSettings::default(),
            last: None,
        }
    }

    pub fn settings(&self) -> &HybridSettings {
        &self.settings
    }

    pub fn motion(&self) -> &MotionDetector {
        &self.motion
    }

    pub fn pose(&self) -> &PoseDetector {
        &self.pose
    }

    pub fn last_breakdown(&self) -> Option<&HybridBreakdown> {
        self.last.as_ref()
    }
}

#[async_trait]
impl Detector for HybridDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Hybrid
    }

    fn config_options(&self) -> OptionSet {
        let mut options = HybridSettings::options();
        for option in self.pose.config_options().values() {
            insert(&mut options, option.prefixed(POSE_PREFIX));
        }
        for option in self.motion.config_options().values() {
            insert(&mut options, option.prefixed(MOTION_PREFIX));
        }
        options
    }

    fn configure(&mut self, config: &ConfigMap) {
        // `pose_weight` and `motion_weight` share the child prefixes, so own keys win.
        let own = HybridSettings::options();
        let mut pose = ConfigMap::new();
        let mut motion = ConfigMap::new();
        for (key, value) in config {
            if own.contains_key(key) {
                continue;
            }
            if let Some(rest) = key.strip_prefix(POSE_PREFIX) {
                pose.insert(rest.to_string(), value.clone());
            } else if let Some(rest) = key.strip_prefix(MOTION_PREFIX) {
                motion.insert(rest.to_string(), value.clone());
            } else {
                log::debug!("hybrid: ignoring unknown option {}", key);
            }
        }
        self.settings.apply(config);
        if !pose.is_empty() {
            self.pose.configure(&pose);
        }
        if !motion.is_empty() {
            self.motion.configure(&motion);
        }
    }

    async fn process(&mut self, frame: &FrameSample) -> DetectionResult {
        let (pose, motion) = tokio::join!(self.pose.process(frame), self.motion.process(frame));
        let (result, combined_confidence) = combine(&self.settings, &pose, &motion);
        self.last = Some(HybridBreakdown {
            pose,
            motion,
            combined_confidence,
        });
        result
    }

    fn set_overlay_enabled(&mut self, enabled: bool) {
        self.motion.set_overlay_enabled(enabled);
    }

    fn take_overlay(&mut self) -> Option<DebugOverlay> {
        self.motion.take_overlay()
    }

    fn reset(&mut self) {
        self.motion.reset();
        self.pose.reset();
        self.last = None;
    }

    fn release(&mut self) {
        self.motion.release();
        self.pose.release();
        self.last = None;
    }
}
