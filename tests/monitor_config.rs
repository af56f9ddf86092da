use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use rider_watch::detect::{ConfigValue, DetectorKind};
use rider_watch::MonitorConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "RIDER_CONFIG",
        "RIDER_DETECTOR",
        "RIDER_SOURCE",
        "RIDER_RECORDING_COOLDOWN_MS",
        "RIDER_RECORDING_DURATION_MS",
        "RIDER_POST_RIDER_DELAY_MS",
        "RIDER_FPS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_toml_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
        detector = "optical_flow"
        overlays = true

        [detector_options]
        max_feature_count = 20
        flow_threshold = 1.5

        [presence]
        recording_cooldown_ms = 1500
        recording_duration_ms = 6000
        post_rider_delay_ms = 2500

        [recording]
        saving_reset_ms = 1000
        error_reset_ms = 4000

        [source]
        uri = "stub://garage"
        fps = 12
        width = 320
        height = 240
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    std::env::set_var("RIDER_CONFIG", file.path());
    std::env::set_var("RIDER_DETECTOR", "hybrid");
    std::env::set_var("RIDER_RECORDING_DURATION_MS", "9000");

    let cfg = MonitorConfig::load().expect("load config");

    assert_eq!(cfg.detector, DetectorKind::Hybrid);
    assert!(cfg.overlays);
    assert_eq!(cfg.detector_options["max_feature_count"], ConfigValue::Int(20));
    assert_eq!(cfg.detector_options["flow_threshold"], ConfigValue::Float(1.5));
    assert_eq!(cfg.presence.recording_cooldown, Duration::from_millis(1500));
    assert_eq!(cfg.presence.recording_duration, Duration::from_millis(9000));
    assert_eq!(cfg.presence.post_rider_delay, Duration::from_millis(2500));
    assert_eq!(cfg.recording.saving_reset, Duration::from_millis(1000));
    assert_eq!(cfg.recording.error_reset, Duration::from_millis(4000));
    assert_eq!(cfg.source.uri, "stub://garage");
    assert_eq!(cfg.source.fps, 12);
    assert_eq!((cfg.source.width, cfg.source.height), (320, 240));

    clear_env();
}

#[test]
fn loads_json_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".json").tempfile().expect("temp config");
    let json = r#"{
        "detector": "pose",
        "detector_options": { "min_poses_required": 8, "confidence_threshold": 0.6 },
        "source": { "uri": "/var/lib/rider/frames" }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("RIDER_CONFIG", file.path());
    std::env::set_var("RIDER_SOURCE", "stub://override");

    let cfg = MonitorConfig::load().expect("load config");
    assert_eq!(cfg.detector, DetectorKind::Pose);
    assert_eq!(cfg.detector_options["min_poses_required"], ConfigValue::Int(8));
    assert_eq!(cfg.source.uri, "stub://override");
    assert_eq!(cfg.source.fps, 15);

    clear_env();
}

#[test]
fn defaults_apply_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = MonitorConfig::load().expect("load config");
    assert_eq!(cfg.detector, DetectorKind::Motion);
    assert!(!cfg.overlays);
    assert!(cfg.detector_options.is_empty());
    assert_eq!(cfg.presence.recording_cooldown, Duration::from_millis(1000));
    assert_eq!(cfg.presence.recording_duration, Duration::from_millis(8000));
    assert_eq!(cfg.presence.post_rider_delay, Duration::from_millis(2000));
    assert!(cfg.source.uri.starts_with("stub://"));
}

#[test]
fn rejects_invalid_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("RIDER_RECORDING_COOLDOWN_MS", "soon");
    assert!(MonitorConfig::load().is_err());
    clear_env();

    std::env::set_var("RIDER_POST_RIDER_DELAY_MS", "0");
    assert!(MonitorConfig::load().is_err());
    clear_env();

    std::env::set_var("RIDER_DETECTOR", "thermal");
    assert!(MonitorConfig::load().is_err());
    clear_env();

    std::env::set_var("RIDER_FPS", "0");
    assert!(MonitorConfig::load().is_err());
    clear_env();
}

#[test]
fn reports_unreadable_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = NamedTempFile::new().expect("temp config");
    let missing = file.path().with_extension("missing");
    std::env::set_var("RIDER_CONFIG", &missing);
    let err = MonitorConfig::load().expect_err("missing file must fail");
    assert!(err.to_string().contains("failed to read config file"));

    clear_env();
}
