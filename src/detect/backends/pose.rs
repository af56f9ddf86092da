use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::detect::backend::{Detector, DetectorKind};
use crate::detect::options::{
    insert, log_unknown_keys, read_f64, read_i64, ConfigMap, ConfigOption, OptionSet,
};
use crate::detect::result::DetectionResult;
use crate::frame::FrameSample;

pub const MIN_POSES_REQUIRED: &str = "min_poses_required";
pub const CONFIDENCE_THRESHOLD: &str = "confidence_threshold";
pub const TIMEOUT_MS: &str = "timeout_ms";

/// One body landmark reported by a pose model.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    /// Independent in-frame likelihood in `0.0..=1.0`.
    pub likelihood: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32, likelihood: f32) -> Self {
        Self { x, y, likelihood }
    }
}

/// External pose-estimation model.
///
/// One image in, one landmark list (or failure) out. Implementations may be slow; callers
/// bound each call with a timeout.
#[async_trait]
pub trait PoseEstimator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn estimate(&self, frame: &FrameSample) -> Result<Vec<Landmark>>;
}

/// Canned estimator for tests and model-less deployments.
#[derive(Clone, Debug, Default)]
pub struct StubPoseEstimator {
    response: StubResponse,
    delay: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
enum StubResponse {
    #[default]
    Empty,
    Landmarks(Vec<Landmark>),
    Failure(String),
}

impl StubPoseEstimator {
    /// Never sees anyone.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_landmarks(landmarks: Vec<Landmark>) -> Self {
        Self {
            response: StubResponse::Landmarks(landmarks),
            delay: None,
        }
    }

    /// `count` landmarks, all with the same likelihood.
    pub fn uniform(count: usize, likelihood: f32) -> Self {
        let landmarks = (0..count)
            .map(|i| Landmark::new(0.5, i as f32 / count.max(1) as f32, likelihood))
            .collect();
        Self::with_landmarks(landmarks)
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            response: StubResponse::Failure(reason.to_string()),
            delay: None,
        }
    }

    /// Simulate model latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl PoseEstimator for StubPoseEstimator {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn estimate(&self, _frame: &FrameSample) -> Result<Vec<Landmark>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.response {
            StubResponse::Empty => Ok(Vec::new()),
            StubResponse::Landmarks(landmarks) => Ok(landmarks.clone()),
            StubResponse::Failure(reason) => Err(anyhow!("{}", reason)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PoseSettings {
    pub min_poses_required: usize,
    /// Mean landmark likelihood that must be exceeded.
    pub confidence_threshold: f64,
    pub timeout: Duration,
}

impl Default for PoseSettings {
    fn default() -> Self {
        Self {
            min_poses_required: 5,
            confidence_threshold: 0.5,
            timeout: Duration::from_millis(2000),
        }
    }
}

impl PoseSettings {
    pub fn options() -> OptionSet {
        let d = Self::default();
        let mut options = OptionSet::new();
        insert(
            &mut options,
            ConfigOption::int(MIN_POSES_REQUIRED, "Minimum landmarks", d.min_poses_required as i64, 1, 64),
        );
        insert(
            &mut options,
            ConfigOption::float(CONFIDENCE_THRESHOLD, "Landmark confidence threshold", d.confidence_threshold, 0.0, 1.0),
        );
        insert(
            &mut options,
            ConfigOption::int(TIMEOUT_MS, "Model timeout (ms)", d.timeout.as_millis() as i64, 50, 10_000),
        );
        options
    }

    pub fn apply(&mut self, config: &ConfigMap) {
        let options = Self::options();
        if let Some(v) = read_i64(&options, config, MIN_POSES_REQUIRED) {
            self.min_poses_required = v as usize;
        }
        if let Some(v) = read_f64(&options, config, CONFIDENCE_THRESHOLD) {
            self.confidence_threshold = v;
        }
        if let Some(v) = read_i64(&options, config, TIMEOUT_MS) {
            self.timeout = Duration::from_millis(v as u64);
        }
        log_unknown_keys("pose", &options, config);
    }
}

/// Thin wrapper that turns landmark lists into presence decisions.
pub struct PoseDetector {
    estimator: Arc<dyn PoseEstimator>,
    settings: PoseSettings,
    last_landmarks: Vec<Landmark>,
}

impl PoseDetector {
    pub fn new(estimator: Arc<dyn PoseEstimator>) -> Self {
        Self {
            estimator,
            settings: PoseSettings::default(),
            last_landmarks: Vec::new(),
        }
    }

    pub fn settings(&self) -> &PoseSettings {
        &self.settings
    }

    pub fn last_landmarks(&self) -> &[Landmark] {
        &self.last_landmarks
    }

    fn evaluate(&self, landmarks: &[Landmark]) -> DetectionResult {
        let likelihoods: Vec<f64> = landmarks
            .iter()
            .map(|l| l.likelihood as f64)
            .filter(|l| l.is_finite())
            .map(|l| l.clamp(0.0, 1.0))
            .collect();
        let mean = if likelihoods.is_empty() {
            0.0
        } else {
            likelihoods.iter().sum::<f64>() / likelihoods.len() as f64
        };
        let rider_detected = likelihoods.len() >= self.settings.min_poses_required
            && mean > self.settings.confidence_threshold;
        DetectionResult::new(
            rider_detected,
            mean,
            format!("{} landmarks, mean likelihood {:.2}", likelihoods.len(), mean),
        )
    }
}

#[async_trait]
impl Detector for PoseDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Pose
    }

    fn config_options(&self) -> OptionSet {
        PoseSettings::options()
    }

    fn configure(&mut self, config: &ConfigMap) {
        self.settings.apply(config);
    }

    async fn process(&mut self, frame: &FrameSample) -> DetectionResult {
        self.last_landmarks.clear();
        let call = self.estimator.estimate(frame);
        match tokio::time::timeout(self.settings.timeout, call).await {
            Ok(Ok(landmarks)) => {
                let result = self.evaluate(&landmarks);
                self.last_landmarks = landmarks;
                result
            }
            Ok(Err(err)) => {
                log::warn!("pose estimator {} failed: {:#}", self.estimator.name(), err);
                DetectionResult::failure(format!("{:#}", err))
            }
            Err(_) => {
                log::warn!(
                    "pose estimator {} timed out after {:?}",
                    self.estimator.name(),
                    self.settings.timeout
                );
                DetectionResult::failure(format!(
                    "timed out after {} ms",
                    self.settings.timeout.as_millis()
                ))
            }
        }
    }

    fn reset(&mut self) {
        self.last_landmarks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::options::ConfigValue;

    fn frame() -> FrameSample {
        FrameSample::from_packed_gray(vec![0u8; 64], 8, 8).unwrap()
    }

    #[tokio::test]
    async fn enough_confident_landmarks_detect_rider() {
        let mut detector = PoseDetector::new(Arc::new(StubPoseEstimator::uniform(10, 0.8)));
        let result = detector.process(&frame()).await;
        assert!(result.rider_detected);
        assert!((result.confidence - 0.8).abs() < 1e-6);
        assert_eq!(detector.last_landmarks().len(), 10);
    }

    #[tokio::test]
    async fn too_few_landmarks_are_not_a_rider() {
        let mut detector = PoseDetector::new(Arc::new(StubPoseEstimator::uniform(3, 0.9)));
        let result = detector.process(&frame()).await;
        assert!(!result.rider_detected);
        assert!((result.confidence - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn threshold_is_strict() {
        let mut detector = PoseDetector::new(Arc::new(StubPoseEstimator::uniform(8, 0.5)));
        assert!(!detector.process(&frame()).await.rider_detected);
    }

    #[tokio::test]
    async fn no_landmarks_means_zero_confidence() {
        let mut detector = PoseDetector::new(Arc::new(StubPoseEstimator::new()));
        let result = detector.process(&frame()).await;
        assert!(!result.rider_detected);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn estimator_failure_becomes_negative_result() {
        let mut detector = PoseDetector::new(Arc::new(StubPoseEstimator::failing("model offline")));
        let result = detector.process(&frame()).await;
        assert!(!result.rider_detected);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.debug_info, "detection failed: model offline");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_estimator_times_out() {
        let estimator = StubPoseEstimator::uniform(10, 0.9).with_delay(Duration::from_secs(30));
        let mut detector = PoseDetector::new(Arc::new(estimator));
        let mut config = ConfigMap::new();
        config.insert(TIMEOUT_MS.into(), ConfigValue::Int(100));
        detector.configure(&config);

        let result = detector.process(&frame()).await;
        assert!(!result.rider_detected);
        assert_eq!(result.debug_info, "detection failed: timed out after 100 ms");
    }

    #[tokio::test]
    async fn non_finite_likelihoods_are_ignored() {
        let mut landmarks = vec![Landmark::new(0.1, 0.1, 0.9); 5];
        landmarks.push(Landmark::new(0.2, 0.2, f32::NAN));
        let mut detector = PoseDetector::new(Arc::new(StubPoseEstimator::with_landmarks(landmarks)));
        let result = detector.process(&frame()).await;
        assert!(result.rider_detected);
        assert!((result.confidence - 0.9).abs() < 1e-6);
    }
}
