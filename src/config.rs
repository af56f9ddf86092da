use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{ConfigMap, DetectorKind};
use crate::presence::PresenceSettings;
use crate::recording::ControllerSettings;

const DEFAULT_DETECTOR: DetectorKind = DetectorKind::Motion;
const DEFAULT_SOURCE_URI: &str = "stub://driveway";
const DEFAULT_SOURCE_FPS: u32 = 15;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    detector: Option<String>,
    overlays: Option<bool>,
    pose_model: Option<PathBuf>,
    detector_options: Option<ConfigMap>,
    presence: Option<PresenceConfigFile>,
    recording: Option<RecordingConfigFile>,
    source: Option<SourceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct PresenceConfigFile {
    recording_cooldown_ms: Option<u64>,
    recording_duration_ms: Option<u64>,
    post_rider_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    saving_reset_ms: Option<u64>,
    error_reset_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    uri: Option<String>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub detector: DetectorKind,
    pub overlays: bool,
    /// ONNX pose model; only used with the `backend-tract` feature.
    pub pose_model: Option<PathBuf>,
    /// Initial key -> value map handed to the detector manager.
    pub detector_options: ConfigMap,
    pub presence: PresenceSettings,
    pub recording: ControllerSettings,
    pub source: SourceSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub uri: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

impl MonitorConfig {
    /// Read `RIDER_CONFIG` (if set), apply `RIDER_*` overrides, and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RIDER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file without consulting the environment.
    pub fn from_path(path: &Path) -> Result<Self> {
        let cfg = Self::from_file(read_config_file(path)?)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Result<Self> {
        let detector = match file.detector.as_deref() {
            Some(name) => name.parse()?,
            None => DEFAULT_DETECTOR,
        };
        let defaults = PresenceSettings::default();
        let presence = file.presence.unwrap_or_default();
        let presence = PresenceSettings {
            recording_cooldown: presence
                .recording_cooldown_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.recording_cooldown),
            recording_duration: presence
                .recording_duration_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.recording_duration),
            post_rider_delay: presence
                .post_rider_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.post_rider_delay),
        };
        let defaults = ControllerSettings::default();
        let recording = file.recording.unwrap_or_default();
        let recording = ControllerSettings {
            saving_reset: recording
                .saving_reset_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.saving_reset),
            error_reset: recording
                .error_reset_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.error_reset),
        };
        let source = file.source.unwrap_or_default();
        let source = SourceSettings {
            uri: source.uri.unwrap_or_else(|| DEFAULT_SOURCE_URI.to_string()),
            fps: source.fps.unwrap_or(DEFAULT_SOURCE_FPS),
            width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
            height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
        };
        Ok(Self {
            detector,
            overlays: file.overlays.unwrap_or(false),
            pose_model: file.pose_model,
            detector_options: file.detector_options.unwrap_or_default(),
            presence,
            recording,
            source,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(detector) = std::env::var("RIDER_DETECTOR") {
            if !detector.trim().is_empty() {
                self.detector = detector.parse()?;
            }
        }
        if let Ok(uri) = std::env::var("RIDER_SOURCE") {
            if !uri.trim().is_empty() {
                self.source.uri = uri;
            }
        }
        if let Some(ms) = env_millis("RIDER_RECORDING_COOLDOWN_MS")? {
            self.presence.recording_cooldown = ms;
        }
        if let Some(ms) = env_millis("RIDER_RECORDING_DURATION_MS")? {
            self.presence.recording_duration = ms;
        }
        if let Some(ms) = env_millis("RIDER_POST_RIDER_DELAY_MS")? {
            self.presence.post_rider_delay = ms;
        }
        if let Ok(fps) = std::env::var("RIDER_FPS") {
            self.source.fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("RIDER_FPS must be an integer frame rate"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.presence.recording_duration.is_zero() {
            return Err(anyhow!("recording duration must be greater than zero"));
        }
        if self.presence.post_rider_delay.is_zero() {
            return Err(anyhow!("post-rider delay must be greater than zero"));
        }
        if self.source.fps == 0 {
            return Err(anyhow!("source fps must be greater than zero"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!(
                "source dimensions must be non-zero ({}x{})",
                self.source.width,
                self.source.height
            ));
        }
        Ok(())
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    match std::env::var(key) {
        Ok(raw) => {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} must be an integer number of milliseconds", key))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(_) => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ConfigValue;

    fn defaults() -> MonitorConfig {
        MonitorConfig::from_file(MonitorConfigFile::default()).unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = defaults();
        assert_eq!(cfg.detector, DetectorKind::Motion);
        assert_eq!(cfg.presence.recording_cooldown, Duration::from_millis(1000));
        assert_eq!(cfg.presence.recording_duration, Duration::from_millis(8000));
        assert_eq!(cfg.presence.post_rider_delay, Duration::from_millis(2000));
        assert_eq!(cfg.recording.saving_reset, Duration::from_secs(2));
        assert_eq!(cfg.recording.error_reset, Duration::from_secs(3));
        assert_eq!(cfg.source.uri, DEFAULT_SOURCE_URI);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_toml_sections() {
        let file: MonitorConfigFile = toml::from_str(
            r#"
            detector = "hybrid"
            overlays = true

            [detector_options]
            pose_weight = 0.6
            motion_min_motion_area = 4000

            [presence]
            post_rider_delay_ms = 1500
            "#,
        )
        .unwrap();
        let cfg = MonitorConfig::from_file(file).unwrap();
        assert_eq!(cfg.detector, DetectorKind::Hybrid);
        assert!(cfg.overlays);
        assert_eq!(cfg.detector_options["pose_weight"], ConfigValue::Float(0.6));
        assert_eq!(cfg.detector_options["motion_min_motion_area"], ConfigValue::Int(4000));
        assert_eq!(cfg.presence.post_rider_delay, Duration::from_millis(1500));
        assert_eq!(cfg.presence.recording_duration, Duration::from_millis(8000));
    }

    #[test]
    fn unknown_detector_is_rejected() {
        let file = MonitorConfigFile {
            detector: Some("thermal".into()),
            ..MonitorConfigFile::default()
        };
        assert!(MonitorConfig::from_file(file).is_err());
    }

    #[test]
    fn zero_duration_fails_validation() {
        let mut cfg = defaults();
        cfg.presence.recording_duration = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }
}
