//! Rider detection strategies and the manager that owns the active one.

mod backend;
pub mod backends;
mod manager;
pub mod options;
mod result;

pub use backend::{Detector, DetectorKind};
pub use backends::{
    build_detector, HybridDetector, Landmark, MotionDetector, OpticalFlowDetector, PoseDetector,
    PoseEstimator, StubPoseEstimator,
};
pub use manager::{DetectorManager, ManagerStats, ProcessedFrame};
pub use options::{ConfigMap, ConfigOption, ConfigValue, OptionSet, OptionType};
pub use result::{DebugOverlay, DetectionResult, FeaturePoint, FlowVector, MotionMask};
