use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::detect::backend::{Detector, DetectorKind};
use crate::detect::options::{
    insert, log_unknown_keys, read_bool, read_i64, ConfigMap, ConfigOption, OptionSet,
};
use crate::detect::result::{DebugOverlay, DetectionResult, MotionMask};
use crate::frame::{FrameSample, GrayPlane};

pub const MOTION_THRESHOLD: &str = "motion_threshold";
pub const MIN_MOTION_AREA: &str = "min_motion_area";
pub const SAMPLE_STRIDE: &str = "sample_stride";
pub const DOWNSCALE: &str = "downscale";
pub const SHOW_MOTION_MASK: &str = "show_motion_mask";

#[derive(Clone, Debug, PartialEq)]
pub struct MotionSettings {
    /// Per-pixel absolute difference that counts as motion (0-255).
    pub motion_threshold: u8,
    /// Approximate moving area, in working-resolution pixels, required for a detection.
    pub min_motion_area: u32,
    pub sample_stride: usize,
    /// Integer downscale factor per axis (2 = quarter resolution).
    pub downscale: usize,
    pub show_motion_mask: bool,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            motion_threshold: 30,
            min_motion_area: 5000,
            sample_stride: 4,
            downscale: 2,
            show_motion_mask: false,
        }
    }
}

impl MotionSettings {
    pub fn options() -> OptionSet {
        let defaults = Self::default();
        let mut options = OptionSet::new();
        insert(
            &mut options,
            ConfigOption::int(MOTION_THRESHOLD, "Motion threshold", defaults.motion_threshold as i64, 0, 255),
        );
        insert(
            &mut options,
            ConfigOption::int(MIN_MOTION_AREA, "Minimum motion area", defaults.min_motion_area as i64, 1, 1_000_000),
        );
        insert(
            &mut options,
            ConfigOption::int(SAMPLE_STRIDE, "Sampling stride (px)", defaults.sample_stride as i64, 1, 16),
        );
        insert(
            &mut options,
            ConfigOption::int(DOWNSCALE, "Downscale factor", defaults.downscale as i64, 1, 8),
        );
        insert(
            &mut options,
            ConfigOption::bool(SHOW_MOTION_MASK, "Show motion mask", defaults.show_motion_mask),
        );
        options
    }

    pub fn apply(&mut self, config: &ConfigMap) {
        let options = Self::options();
        if let Some(v) = read_i64(&options, config, MOTION_THRESHOLD) {
            self.motion_threshold = v as u8;
        }
        if let Some(v) = read_i64(&options, config, MIN_MOTION_AREA) {
            self.min_motion_area = v as u32;
        }
        if let Some(v) = read_i64(&options, config, SAMPLE_STRIDE) {
            self.sample_stride = v as usize;
        }
        if let Some(v) = read_i64(&options, config, DOWNSCALE) {
            self.downscale = v as usize;
        }
        if let Some(v) = read_bool(&options, config, SHOW_MOTION_MASK) {
            self.show_motion_mask = v;
        }
        log_unknown_keys("motion", &options, config);
    }
}

/// Frame-differencing detector.
///
/// Compares the downscaled current frame with the retained previous one on a sparse
/// sampling grid and scales the changed-sample count back to an area estimate.
#[derive(Default)]
pub struct MotionDetector {
    settings: MotionSettings,
    previous: Option<GrayPlane>,
    overlays_enabled: bool,
    overlay: Option<DebugOverlay>,
    last_motion_area: u64,
}

impl MotionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: MotionSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }

    /// Estimated moving area from the last processed frame.
    pub fn last_motion_area(&self) -> u64 {
        self.last_motion_area
    }

    fn analyze(&mut self, frame: &FrameSample) -> Result<DetectionResult> {
        let current = GrayPlane::downscaled(frame, self.settings.downscale);
        // The retained frame is always replaced, whatever the outcome.
        let previous = self.previous.replace(current);
        let current = self
            .previous
            .as_ref()
            .ok_or_else(|| anyhow!("retained frame missing"))?;

        let Some(previous) = previous else {
            self.last_motion_area = 0;
            return Ok(DetectionResult::negative("first frame"));
        };
        if !previous.same_size(current) {
            self.last_motion_area = 0;
            return Ok(DetectionResult::negative(format!(
                "frame size changed to {}x{}, restarting",
                current.width(),
                current.height()
            )));
        }

        let stride = self.settings.sample_stride.max(1);
        let threshold = self.settings.motion_threshold;
        let want_mask = self.overlays_enabled || self.settings.show_motion_mask;
        let columns = current.width().div_ceil(stride);
        let rows = current.height().div_ceil(stride);
        let mut cells = if want_mask {
            Vec::with_capacity(columns * rows)
        } else {
            Vec::new()
        };

        let mut moving_samples = 0u64;
        for y in (0..current.height()).step_by(stride) {
            for x in (0..current.width()).step_by(stride) {
                let diff = current.get(x, y).abs_diff(previous.get(x, y));
                let moving = diff > threshold;
                if moving {
                    moving_samples += 1;
                }
                if want_mask {
                    cells.push(moving);
                }
            }
        }

        let motion_area = moving_samples * (stride * stride) as u64;
        self.last_motion_area = motion_area;
        if want_mask {
            self.overlay = Some(DebugOverlay::MotionMask(MotionMask {
                columns,
                rows,
                cell_size: stride,
                cells,
            }));
        }

        let min_area = self.settings.min_motion_area.max(1) as f64;
        let rider_detected = motion_area as f64 > min_area;
        let confidence = (motion_area as f64 / (min_area * 3.0)).min(1.0);
        Ok(DetectionResult::new(
            rider_detected,
            confidence,
            format!("motion area {} (min {})", motion_area, self.settings.min_motion_area),
        ))
    }
}

#[async_trait]
impl Detector for MotionDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Motion
    }

    fn config_options(&self) -> OptionSet {
        MotionSettings::options()
    }

    fn configure(&mut self, config: &ConfigMap) {
        let before = self.settings.downscale;
        self.settings.apply(config);
        if before != self.settings.downscale {
            // Retained frame was taken at the old resolution.
            self.previous = None;
        }
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
        self.overlay = None;
        self.last_motion_area = 0;
    }
}
