//! Sparse optical-flow detector.
//!
//! Works on a fixed 160x120 plane so per-frame cost is bounded regardless of camera
//! resolution:
//!
//! 1. Harris corners on a coarse grid seed up to `max_feature_count` features.
//! 2. Each feature is tracked into the next frame by SSD template matching over a
//!    bounded neighbourhood (coarse step, optional 1 px refinement).
//! 3. Vectors that are too short (noise) or too long (mismatch) are discarded.
//! 4. A rider is reported when enough vectors agree with the circular mean direction.
//!
//! Features are replenished from fresh corners whenever fewer than half survive.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::f32::consts::{PI, TAU};

use crate::detect::backend::{Detector, DetectorKind};
use crate::detect::options::{
    insert, log_unknown_keys, read_bool, read_f64, read_i64, read_text, ConfigMap, ConfigOption,
    OptionSet,
};
use crate::detect::result::{DebugOverlay, DetectionResult, FeaturePoint, FlowVector};
use crate::frame::{FrameSample, GrayPlane};

pub const MAX_FEATURE_COUNT: &str = "max_feature_count";
pub const MIN_FEATURE_DISTANCE: &str = "min_feature_distance";
pub const FLOW_THRESHOLD: &str = "flow_threshold";
pub const MAX_VECTOR_MAGNITUDE: &str = "max_vector_magnitude";
pub const MIN_COHERENT_VECTORS: &str = "min_coherent_vectors";
pub const TEMPLATE_SIZE: &str = "template_size";
pub const SEARCH_RADIUS: &str = "search_radius";
pub const TRACKING_PRECISION: &str = "tracking_precision";
pub const SHOW_FLOW: &str = "show_flow";

pub const WORK_WIDTH: usize = 160;
pub const WORK_HEIGHT: usize = 120;

const GRID_STRIDE: usize = 12;
/// Half size of the structure-tensor window (5x5).
const HARRIS_HALF_WINDOW: isize = 2;
const HARRIS_K: f32 = 0.04;
const HARRIS_THRESHOLD: f32 = 1.0e6;
const SEARCH_STEP: usize = 2;
/// Mean squared intensity difference per template pixel above which a match is unreliable.
const MAX_MEAN_SSD: f32 = 400.0;
const COHERENCE_TOLERANCE: f32 = 50.0 * PI / 180.0;
/// Mean magnitude (px) that maps to full magnitude confidence.
const MAGNITUDE_FOR_FULL_CONFIDENCE: f32 = 8.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackingPrecision {
    /// Coarse search grid only.
    Coarse,
    /// Coarse grid followed by a 1 px neighbourhood pass.
    Refined,
}

impl TrackingPrecision {
    fn as_str(&self) -> &'static str {
        match self {
            TrackingPrecision::Coarse => "coarse",
            TrackingPrecision::Refined => "refined",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpticalFlowSettings {
    pub max_feature_count: usize,
    pub min_feature_distance: f32,
    pub flow_threshold: f32,
    pub max_vector_magnitude: f32,
    pub min_coherent_vectors: usize,
    /// Odd template side length.
    pub template_size: usize,
    pub search_radius: usize,
    pub tracking_precision: TrackingPrecision,
    pub show_flow: bool,
}

impl Default for OpticalFlowSettings {
    fn default() -> Self {
        Self {
            max_feature_count: 24,
            min_feature_distance: 16.0,
            flow_threshold: 1.0,
            max_vector_magnitude: 15.0,
            min_coherent_vectors: 4,
            template_size: 9,
            search_radius: 10,
            tracking_precision: TrackingPrecision::Refined,
            show_flow: false,
        }
    }
}

impl OpticalFlowSettings {
    pub fn options() -> OptionSet {
        let d = Self::default();
        let mut options = OptionSet::new();
        insert(
            &mut options,
            ConfigOption::int(MAX_FEATURE_COUNT, "Max tracked features", d.max_feature_count as i64, 4, 100),
        );
        insert(
            &mut options,
            ConfigOption::float(MIN_FEATURE_DISTANCE, "Min feature distance (px)", d.min_feature_distance as f64, 4.0, 60.0),
        );
        insert(
            &mut options,
            ConfigOption::float(FLOW_THRESHOLD, "Flow threshold (px)", d.flow_threshold as f64, 0.1, 20.0),
        );
        insert(
            &mut options,
            ConfigOption::float(MAX_VECTOR_MAGNITUDE, "Max vector magnitude (px)", d.max_vector_magnitude as f64, 1.0, 40.0),
        );
        insert(
            &mut options,
            ConfigOption::int(MIN_COHERENT_VECTORS, "Min coherent vectors", d.min_coherent_vectors as i64, 1, 100),
        );
        insert(
            &mut options,
            ConfigOption::int(TEMPLATE_SIZE, "Template size (px)", d.template_size as i64, 5, 15),
        );
        insert(
            &mut options,
            ConfigOption::int(SEARCH_RADIUS, "Search radius (px)", d.search_radius as i64, 2, 20),
        );
        insert(
            &mut options,
            ConfigOption::choice(
                TRACKING_PRECISION,
                "Tracking precision",
                d.tracking_precision.as_str(),
                &["coarse", "refined"],
            ),
        );
        insert(&mut options, ConfigOption::bool(SHOW_FLOW, "Show flow vectors", d.show_flow));
        options
    }

    pub fn apply(&mut self, config: &ConfigMap) {
        let options = Self::options();
        if let Some(v) = read_i64(&options, config, MAX_FEATURE_COUNT) {
            self.max_feature_count = v as usize;
        }
        if let Some(v) = read_f64(&options, config, MIN_FEATURE_DISTANCE) {
            self.min_feature_distance = v as f32;
        }
        if let Some(v) = read_f64(&options, config, FLOW_THRESHOLD) {
            self.flow_threshold = v as f32;
        }
        if let Some(v) = read_f64(&options, config, MAX_VECTOR_MAGNITUDE) {
            self.max_vector_magnitude = v as f32;
        }
        if let Some(v) = read_i64(&options, config, MIN_COHERENT_VECTORS) {
            self.min_coherent_vectors = v as usize;
        }
        if let Some(v) = read_i64(&options, config, TEMPLATE_SIZE) {
            // Even sizes have no centre pixel.
            self.template_size = (v as usize) | 1;
        }
        if let Some(v) = read_i64(&options, config, SEARCH_RADIUS) {
            self.search_radius = v as usize;
        }
        if let Some(v) = read_text(&options, config, TRACKING_PRECISION) {
            self.tracking_precision = match v.as_str() {
                "coarse" => TrackingPrecision::Coarse,
                _ => TrackingPrecision::Refined,
            };
        }
        if let Some(v) = read_bool(&options, config, SHOW_FLOW) {
            self.show_flow = v;
        }
        log_unknown_keys("optical_flow", &options, config);
    }
}

/// Aggregate statistics of one frame's flow field.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FlowSummary {
    pub vector_count: usize,
    pub coherent_count: usize,
    pub mean_magnitude: f32,
    pub mean_angle: f32,
}

#[derive(Default)]
pub struct OpticalFlowDetector {
    settings: OpticalFlowSettings,
    previous: Option<GrayPlane>,
    features: Vec<FeaturePoint>,
    overlays_enabled: bool,
    overlay: Option<DebugOverlay>,
    last_summary: FlowSummary,
}

impl OpticalFlowDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: OpticalFlowSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn settings(&self) -> &OpticalFlowSettings {
        &self.settings
    }

    /// Features retained for the next frame.
    pub fn tracked_features(&self) -> &[FeaturePoint] {
        &self.features
    }

    pub fn last_summary(&self) -> FlowSummary {
        self.last_summary
    }

    fn analyze(&mut self, frame: &FrameSample) -> Result<DetectionResult> {
        let current = GrayPlane::resampled(frame, WORK_WIDTH, WORK_HEIGHT);
        let previous = self.previous.replace(current);
        let current = self
            .previous
            .as_ref()
            .ok_or_else(|| anyhow!("retained frame missing"))?;
        self.last_summary = FlowSummary::default();

        let Some(previous) = previous else {
            self.features = detect_features(current, &[], &self.settings);
            return Ok(DetectionResult::negative(format!(
                "first frame: {} features",
                self.features.len()
            )));
        };

        let mut survivors = Vec::with_capacity(self.features.len());
        let mut vectors = Vec::with_capacity(self.features.len());
        for feature in &self.features {
            let Some(tracked) = track_feature(&previous, current, feature, &self.settings) else {
                continue;
            };
            let vector = FlowVector::between(*feature, tracked);
            if !vector.magnitude.is_finite() || !vector.angle.is_finite() {
                continue;
            }
            if vector.magnitude > self.settings.max_vector_magnitude {
                // Implausible jump: treat the match as wrong and stop tracking it.
                continue;
            }
            survivors.push(tracked);
            if vector.magnitude >= self.settings.flow_threshold {
                vectors.push(vector);
            }
        }

        if survivors.len() < self.settings.max_feature_count / 2 {
            let fresh = detect_features(current, &survivors, &self.settings);
            survivors.extend(fresh);
        }
        self.features = survivors;

        if self.overlays_enabled || self.settings.show_flow {
            self.overlay = Some(DebugOverlay::Flow {
                features: self.features.clone(),
                vectors: vectors.clone(),
            });
        }

        if vectors.is_empty() {
            return Ok(DetectionResult::negative(format!(
                "no motion vectors ({} features tracked)",
                self.features.len()
            )));
        }

        let summary = summarize(&vectors);
        self.last_summary = summary;

        let plausible = summary.mean_magnitude >= self.settings.flow_threshold
            && summary.mean_magnitude <= self.settings.max_vector_magnitude;
        let rider_detected =
            summary.coherent_count >= self.settings.min_coherent_vectors && plausible;

        let magnitude_score = (summary.mean_magnitude / MAGNITUDE_FOR_FULL_CONFIDENCE).min(1.0);
        let count_score =
            (summary.vector_count as f32 / self.settings.max_feature_count.max(1) as f32).min(1.0);
        let confidence = 0.6 * magnitude_score as f64 + 0.4 * count_score as f64;

        Ok(DetectionResult::new(
            rider_detected,
            confidence,
            format!(
                "vectors {} coherent {} mean magnitude {:.2} angle {:.1} deg",
                summary.vector_count,
                summary.coherent_count,
                summary.mean_magnitude,
                summary.mean_angle.to_degrees()
            ),
        ))
    }
}

#[async_trait]
impl Detector for OpticalFlowDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::OpticalFlow
    }

    fn config_options(&self) -> OptionSet {
        OpticalFlowSettings::options()
    }

    fn configure(&mut self, config: &ConfigMap) {
        self.settings.apply(config);
        self.features.truncate(self.settings.max_feature_count);
    }

    async fn process(&mut self, frame: &FrameSample) -> DetectionResult {
        self.overlay = None;
        self.analyze(frame).unwrap_or_else(DetectionResult::failure)
    }

    fn set_overlay_enabled(&mut self, enabled: bool) {
        self.overlays_enabled = enabled;
    }

    fn take_overlay(&mut self) -> Option<DebugOverlay> {
        self.overlay.take()
    }

    fn reset(&mut self) {
        self.previous = None;
        self.features.clear();
        self.overlay = None;
        self.last_summary = FlowSummary::default();
    }
}

// ----------------------------------------------------------------------------
// Corner detection
// ----------------------------------------------------------------------------

fn harris_response(plane: &GrayPlane, cx: usize, cy: usize) -> f32 {
    let (mut ixx, mut iyy, mut ixy) = (0.0f32, 0.0f32, 0.0f32);
    for wy in -HARRIS_HALF_WINDOW..=HARRIS_HALF_WINDOW {
        for wx in -HARRIS_HALF_WINDOW..=HARRIS_HALF_WINDOW {
            let x = (cx as isize + wx) as usize;
            let y = (cy as isize + wy) as usize;
            let ix = (plane.get(x + 1, y) as f32 - plane.get(x - 1, y) as f32) * 0.5;
            let iy = (plane.get(x, y + 1) as f32 - plane.get(x, y - 1) as f32) * 0.5;
            ixx += ix * ix;
            iyy += iy * iy;
            ixy += ix * iy;
        }
    }
    let det = ixx * iyy - ixy * ixy;
    let trace = ixx + iyy;
    det - HARRIS_K * trace * trace
}

fn feature_margin(settings: &OpticalFlowSettings) -> usize {
    (settings.template_size / 2).max(HARRIS_HALF_WINDOW as usize + 1) + 1
}

/// Strongest grid corners that keep `min_feature_distance` from each other and from
/// `existing`, limited so that `existing.len() + result.len() <= max_feature_count`.
fn detect_features(
    plane: &GrayPlane,
    existing: &[FeaturePoint],
    settings: &OpticalFlowSettings,
) -> Vec<FeaturePoint> {
    let budget = settings.max_feature_count.saturating_sub(existing.len());
    if budget == 0 {
        return Vec::new();
    }
    let margin = feature_margin(settings);
    if plane.width() <= 2 * margin || plane.height() <= 2 * margin {
        return Vec::new();
    }

    let mut candidates = Vec::new();
    for y in (margin..plane.height() - margin).step_by(GRID_STRIDE) {
        for x in (margin..plane.width() - margin).step_by(GRID_STRIDE) {
            let response = harris_response(plane, x, y);
            if response > HARRIS_THRESHOLD {
                candidates.push(FeaturePoint::new(x as f32, y as f32, response));
            }
        }
    }
    candidates.sort_by(|a, b| b.strength.total_cmp(&a.strength));

    let mut accepted: Vec<FeaturePoint> = Vec::with_capacity(budget);
    for candidate in candidates {
        if accepted.len() >= budget {
            break;
        }
        let far_enough = existing
            .iter()
            .chain(accepted.iter())
            .all(|f| f.distance_to(&candidate) >= settings.min_feature_distance);
        if far_enough {
            accepted.push(candidate);
        }
    }
    accepted
}

// ----------------------------------------------------------------------------
// Template tracking
// ----------------------------------------------------------------------------

fn template_fits(plane: &GrayPlane, x: isize, y: isize, half: isize) -> bool {
    x - half >= 0
        && y - half >= 0
        && x + half < plane.width() as isize
        && y + half < plane.height() as isize
}

fn ssd(
    previous: &GrayPlane,
    (px, py): (isize, isize),
    current: &GrayPlane,
    (cx, cy): (isize, isize),
    half: isize,
    bail_above: f32,
) -> f32 {
    let mut sum = 0.0f32;
    for dy in -half..=half {
        for dx in -half..=half {
            let a = previous.get((px + dx) as usize, (py + dy) as usize) as f32;
            let b = current.get((cx + dx) as usize, (cy + dy) as usize) as f32;
            let d = a - b;
            sum += d * d;
        }
        if sum > bail_above {
            return sum;
        }
    }
    sum
}

fn track_feature(
    previous: &GrayPlane,
    current: &GrayPlane,
    feature: &FeaturePoint,
    settings: &OpticalFlowSettings,
) -> Option<FeaturePoint> {
    let half = (settings.template_size / 2) as isize;
    let origin = (feature.x.round() as isize, feature.y.round() as isize);
    if !template_fits(previous, origin.0, origin.1, half) {
        return None;
    }

    let radius = settings.search_radius as isize;
    let mut best: Option<((isize, isize), f32)> = None;
    let consider = |candidate: (isize, isize), best: &mut Option<((isize, isize), f32)>| {
        if !template_fits(current, candidate.0, candidate.1, half) {
            return;
        }
        let bail = best.map(|(_, s)| s).unwrap_or(f32::INFINITY);
        let score = ssd(previous, origin, current, candidate, half, bail);
        if best.map_or(true, |(_, s)| score < s) {
            *best = Some((candidate, score));
        }
    };

    for dy in (-radius..=radius).step_by(SEARCH_STEP) {
        for dx in (-radius..=radius).step_by(SEARCH_STEP) {
            consider((origin.0 + dx, origin.1 + dy), &mut best);
        }
    }
    if settings.tracking_precision == TrackingPrecision::Refined {
        if let Some(((bx, by), _)) = best {
            for dy in -1..=1isize {
                for dx in -1..=1isize {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let candidate = (bx + dx, by + dy);
                    if (candidate.0 - origin.0).abs() <= radius && (candidate.1 - origin.1).abs() <= radius {
                        consider(candidate, &mut best);
                    }
                }
            }
        }
    }

    let ((x, y), score) = best?;
    let side = (2 * half + 1) as f32;
    if score / (side * side) > MAX_MEAN_SSD {
        return None;
    }
    Some(FeaturePoint::new(x as f32, y as f32, feature.strength))
}

// ----------------------------------------------------------------------------
// Coherence
// ----------------------------------------------------------------------------

fn angular_distance(a: f32, b: f32) -> f32 {
    let mut d = (a - b) % TAU;
    if d > PI {
        d -= TAU;
    } else if d < -PI {
        d += TAU;
    }
    d.abs()
}

fn summarize(vectors: &[FlowVector]) -> FlowSummary {
    let (sin_sum, cos_sum) = vectors
        .iter()
        .fold((0.0f32, 0.0f32), |(s, c), v| (s + v.angle.sin(), c + v.angle.cos()));
    let mean_angle = sin_sum.atan2(cos_sum);
    let coherent_count = vectors
        .iter()
        .filter(|v| angular_distance(v.angle, mean_angle) <= COHERENCE_TOLERANCE)
        .count();
    let mean_magnitude = vectors.iter().map(|v| v.magnitude).sum::<f32>() / vectors.len() as f32;
    FlowSummary {
        vector_count: vectors.len(),
        coherent_count,
        mean_magnitude,
        mean_angle,
    }
}
