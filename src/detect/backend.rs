use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::detect::options::{ConfigMap, OptionSet};
use crate::detect::result::{DebugOverlay, DetectionResult};
use crate::frame::FrameSample;

/// Closed set of detector strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Pose,
    Motion,
    OpticalFlow,
    Hybrid,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 4] = [
        DetectorKind::Pose,
        DetectorKind::Motion,
        DetectorKind::OpticalFlow,
        DetectorKind::Hybrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Pose => "pose",
            DetectorKind::Motion => "motion",
            DetectorKind::OpticalFlow => "optical_flow",
            DetectorKind::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        DetectorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                anyhow!(
                    "unknown detector '{}' (expected pose, motion, optical_flow or hybrid)",
                    s
                )
            })
    }
}

/// Frame-analysis strategy.
///
/// Instances hold cross-frame state (previous frame, tracked features) and are not safe
/// for concurrent invocation: `process` takes `&mut self`, so a single owner can only ever
/// have one call in flight.
///
/// `process` always yields a terminal result. Analysis faults are reported as
/// `DetectionResult::failure`, never as errors or panics.
#[async_trait]
pub trait Detector: Send {
    fn kind(&self) -> DetectorKind;

    /// Tunables understood by `configure`.
    fn config_options(&self) -> OptionSet;

    /// Apply a key -> value map. Unknown keys are ignored, numbers are clamped.
    fn configure(&mut self, config: &ConfigMap);

    async fn process(&mut self, frame: &FrameSample) -> DetectionResult;

    /// Enable or disable debug overlay output. Never changes detection results.
    fn set_overlay_enabled(&mut self, _enabled: bool) {}

    /// Overlay produced by the last `process` call, if overlays are enabled.
    fn take_overlay(&mut self) -> Option<DebugOverlay> {
        None
    }

    /// Clear all cross-frame state.
    fn reset(&mut self);

    /// Free resources before the instance is dropped.
    fn release(&mut self) {
        self.reset();
    }
}
