pub mod hybrid;
pub mod motion;
pub mod optical_flow;
pub mod pose;

#[cfg(feature = "backend-tract")]
pub mod tract;

use std::sync::Arc;

use crate::detect::backend::{Detector, DetectorKind};

pub use hybrid::{HybridBreakdown, HybridDetector, HybridSettings};
pub use motion::{MotionDetector, MotionSettings};
pub use optical_flow::{FlowSummary, OpticalFlowDetector, OpticalFlowSettings, TrackingPrecision};
pub use pose::{Landmark, PoseDetector, PoseEstimator, PoseSettings, StubPoseEstimator};

#[cfg(feature = "backend-tract")]
pub use tract::TractPoseEstimator;

/// Construct a fresh detector of `kind` with default settings.
///
/// Pose-based strategies share `estimator`; the others ignore it.
pub fn build_detector(kind: DetectorKind, estimator: &Arc<dyn PoseEstimator>) -> Box<dyn Detector> {
    match kind {
        DetectorKind::Pose => Box::new(PoseDetector::new(Arc::clone(estimator))),
        DetectorKind::Motion => Box::new(MotionDetector::new()),
        DetectorKind::OpticalFlow => Box::new(OpticalFlowDetector::new()),
        DetectorKind::Hybrid => Box::new(HybridDetector::new(Arc::clone(estimator))),
    }
}
