//! rider_monitor - rider presence monitoring daemon
//!
//! This daemon:
//! 1. Pulls frames from the configured source at the configured rate
//! 2. Hands them over through a keep-latest slot (stale frames are dropped, not queued)
//! 3. Runs the active detector on each frame
//! 4. Tracks rider presence and starts/stops the recorder
//! 5. Logs (or prints as JSON lines) every event that leaves the core

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use rider_watch::detect::{DetectorKind, DetectorManager, PoseEstimator, StubPoseEstimator};
use rider_watch::ingest::FrameSource;
use rider_watch::recording::LoggingBackend;
use rider_watch::{Frame, FrameSlot, Monitor, MonitorCommand, MonitorConfig, MonitorEvent};

#[cfg(feature = "backend-tract")]
const POSE_INPUT_SIZE: u32 = 256;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (TOML, or JSON with a .json extension).
    #[arg(long, env = "RIDER_CONFIG")]
    config: Option<PathBuf>,
    /// Detector to run: pose, motion, optical_flow or hybrid.
    #[arg(long)]
    detector: Option<DetectorKind>,
    /// Frame source: stub://<name> or a local image directory.
    #[arg(long)]
    source: Option<String>,
    /// Stop after this many seconds (runs until Ctrl-C otherwise).
    #[arg(long)]
    seconds: Option<u64>,
    /// Emit debug overlays.
    #[arg(long)]
    overlays: bool,
    /// Print events to stdout as JSON lines.
    #[arg(long)]
    json_events: bool,
    /// ONNX pose model used by the pose and hybrid detectors.
    #[cfg(feature = "backend-tract")]
    #[arg(long)]
    pose_model: Option<PathBuf>,
}

impl Args {
    #[cfg(feature = "backend-tract")]
    fn pose_model(&self) -> Option<PathBuf> {
        self.pose_model.clone()
    }

    #[cfg(not(feature = "backend-tract"))]
    fn pose_model(&self) -> Option<PathBuf> {
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("RIDER_CONFIG", path);
    }
    let mut cfg = MonitorConfig::load()?;
    if let Some(detector) = args.detector {
        cfg.detector = detector;
    }
    if let Some(source) = &args.source {
        cfg.source.uri = source.clone();
    }
    cfg.overlays |= args.overlays;
    if let Some(model) = args.pose_model() {
        cfg.pose_model = Some(model);
    }

    let estimator = pose_estimator(&cfg)?;
    let mut manager = DetectorManager::new(cfg.detector, estimator);
    manager.configure(&cfg.detector_options);
    manager.set_overlays(cfg.overlays);

    let (monitor, mut events) = Monitor::new(
        manager,
        cfg.presence,
        Arc::new(LoggingBackend::default()),
        cfg.recording,
    );

    let mut source = FrameSource::open(&cfg.source)?;
    source.connect()?;

    let slot = Arc::new(FrameSlot::new());
    let (commands, command_rx) = mpsc::unbounded_channel();
    let shutdown = commands.clone();
    ctrlc::set_handler(move || {
        let _ = shutdown.send(MonitorCommand::Shutdown);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let deadline = args
        .seconds
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let producer = tokio::spawn(produce(source, Arc::clone(&slot), deadline));

    let json_events = args.json_events;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            report(&event, json_events);
        }
    });

    log::info!(
        "rider_monitor running: detector={} source={} fps={}",
        cfg.detector,
        cfg.source.uri,
        cfg.source.fps
    );
    monitor.run(Arc::clone(&slot), command_rx).await;
    drop(commands);

    if let Err(e) = producer.await {
        log::warn!("frame producer ended abnormally: {}", e);
    }
    // Recorder tasks may still be flushing their last event.
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        log::debug!("event printer did not drain in time");
    }
    log::info!("rider_monitor stopped");
    Ok(())
}

#[cfg(feature = "backend-tract")]
fn pose_estimator(cfg: &MonitorConfig) -> Result<Arc<dyn PoseEstimator>> {
    use rider_watch::detect::backends::TractPoseEstimator;

    match &cfg.pose_model {
        Some(path) => {
            let estimator = TractPoseEstimator::new(path, POSE_INPUT_SIZE, POSE_INPUT_SIZE)?;
            log::info!("pose model loaded from {}", path.display());
            Ok(Arc::new(estimator))
        }
        None => Ok(stub_estimator(cfg.detector)),
    }
}

#[cfg(not(feature = "backend-tract"))]
fn pose_estimator(cfg: &MonitorConfig) -> Result<Arc<dyn PoseEstimator>> {
    if cfg.pose_model.is_some() {
        log::warn!("pose_model ignored: built without the backend-tract feature");
    }
    Ok(stub_estimator(cfg.detector))
}

fn stub_estimator(detector: DetectorKind) -> Arc<dyn PoseEstimator> {
    if matches!(detector, DetectorKind::Pose | DetectorKind::Hybrid) {
        log::warn!("no pose model configured; pose estimates will be empty");
    }
    Arc::new(StubPoseEstimator::new())
}

async fn produce(mut source: FrameSource, slot: Arc<FrameSlot>, deadline: Option<Instant>) {
    let mut ticker = tokio::time::interval(source.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_health_log = Instant::now();

    loop {
        ticker.tick().await;
        if deadline.is_some_and(|d| Instant::now() >= d) {
            log::info!("run time elapsed");
            break;
        }
        let sample = match source.next_frame() {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                log::info!("source exhausted");
                break;
            }
            Err(e) => {
                log::warn!("frame capture failed: {:#}", e);
                continue;
            }
        };
        if !slot.push(Frame::new(sample)) {
            break;
        }

        if last_health_log.elapsed() >= Duration::from_secs(5) {
            let stats = source.stats();
            let slot_stats = slot.stats();
            log::info!(
                "source {} frames={} dropped={}",
                stats.uri,
                stats.frames_captured,
                slot_stats.dropped
            );
            last_health_log = Instant::now();
        }
    }
    slot.close();
}

fn report(event: &MonitorEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => log::warn!("failed to encode event: {}", e),
        }
        return;
    }
    match event {
        MonitorEvent::Detection { .. } | MonitorEvent::Overlay { .. } => {
            log::debug!("{:?}", event)
        }
        other => log::info!("event: {:?}", other),
    }
}
