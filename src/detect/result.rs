use serde::Serialize;

const FAILURE_PREFIX: &str = "detection failed: ";

/// Uniform output of every detector strategy.
///
/// `confidence` is detector specific: scores from different strategies are only
/// comparable inside the hybrid detector's explicit weighting.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    pub rider_detected: bool,
    /// Always within `0.0..=1.0`.
    pub confidence: f64,
    pub debug_info: String,
}

impl DetectionResult {
    pub fn new(rider_detected: bool, confidence: f64, debug_info: impl Into<String>) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            rider_detected,
            confidence,
            debug_info: debug_info.into(),
        }
    }

    /// Negative result carrying a reason (first frame, no detector, ...).
    pub fn negative(debug_info: impl Into<String>) -> Self {
        Self::new(false, 0.0, debug_info)
    }

    /// Negative result for a per-frame analysis fault.
    pub fn failure(reason: impl std::fmt::Display) -> Self {
        Self::negative(format!("{}{}", FAILURE_PREFIX, reason))
    }

    pub fn is_failure(&self) -> bool {
        self.debug_info.starts_with(FAILURE_PREFIX)
    }
}

/// Tracked image location. `strength` is the corner response at detection time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FeaturePoint {
    pub x: f32,
    pub y: f32,
    pub strength: f32,
}

impl FeaturePoint {
    pub fn new(x: f32, y: f32, strength: f32) -> Self {
        Self { x, y, strength }
    }

    pub fn distance_to(&self, other: &FeaturePoint) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Displacement of one feature between two consecutive frames.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FlowVector {
    pub start: FeaturePoint,
    pub end: FeaturePoint,
    pub magnitude: f32,
    /// Radians, `atan2(dy, dx)`.
    pub angle: f32,
}

impl FlowVector {
    pub fn between(start: FeaturePoint, end: FeaturePoint) -> Self {
        let dx = end.x - start.x;
        let dy = end.y - start.y;
        Self {
            start,
            end,
            magnitude: (dx * dx + dy * dy).sqrt(),
            angle: dy.atan2(dx),
        }
    }
}

/// Coarse motion mask: one cell per sampled position, row-major.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MotionMask {
    pub columns: usize,
    pub rows: usize,
    /// Pixel spacing between cells in the detector's working resolution.
    pub cell_size: usize,
    pub cells: Vec<bool>,
}

impl MotionMask {
    pub fn active_cells(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }
}

/// Debug visualisation handed to overlay consumers. Never read back by detectors.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum DebugOverlay {
    MotionMask(MotionMask),
    Flow {
        features: Vec<FeaturePoint>,
        vectors: Vec<FlowVector>,
    },
}
