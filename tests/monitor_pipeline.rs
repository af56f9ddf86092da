use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use rider_watch::config::SourceSettings;
use rider_watch::detect::{ConfigMap, ConfigValue, DetectorKind, DetectorManager, StubPoseEstimator};
use rider_watch::ingest::FrameSource;
use rider_watch::presence::{PresenceEdge, PresenceSettings};
use rider_watch::recording::{ControllerSettings, LoggingBackend, RecordingEvent, RecordingState};
use rider_watch::{Frame, FrameSample, FrameSlot, Monitor, MonitorCommand, MonitorEvent};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

fn scene(block_x: Option<u32>) -> FrameSample {
    let mut data = vec![50u8; (WIDTH * HEIGHT) as usize];
    if let Some(bx) = block_x {
        for y in 140..340 {
            for x in bx..bx + 200 {
                data[(y * WIDTH + x) as usize] = 230;
            }
        }
    }
    FrameSample::from_packed_gray(data, WIDTH, HEIGHT).unwrap()
}

fn motion_monitor() -> (Monitor, mpsc::UnboundedReceiver<MonitorEvent>) {
    Monitor::with_detector(
        DetectorKind::Motion,
        Arc::new(StubPoseEstimator::new()),
        PresenceSettings::default(),
        Arc::new(LoggingBackend::default()),
        ControllerSettings::default(),
    )
}

fn non_detection(events: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if !matches!(event, MonitorEvent::Detection { .. }) {
            out.push(event);
        }
    }
    out
}

#[tokio::test(start_paused = true)]
async fn rider_pass_records_one_clip() {
    let (mut monitor, mut events) = motion_monitor();
    let step = Duration::from_millis(100);

    // t = 0.0 .. 0.1: empty scene.
    monitor.handle_frame(Frame::new(scene(None))).await;
    tokio::time::sleep(step).await;
    monitor.handle_frame(Frame::new(scene(None))).await;

    // t = 0.2 .. 1.1: a rider moving back and forth.
    for i in 0..10 {
        tokio::time::sleep(step).await;
        let x = if i % 2 == 0 { 100 } else { 340 };
        let result = monitor.handle_frame(Frame::new(scene(Some(x)))).await;
        assert!(result.rider_detected, "frame {} should see the rider", i);
    }
    assert_eq!(monitor.recording_state(), RecordingState::Recording);

    // Rider gone; recording continues through the grace window.
    for _ in 0..25 {
        tokio::time::sleep(step).await;
        monitor.handle_frame(Frame::new(scene(None))).await;
    }
    tokio::time::sleep(Duration::from_secs(3)).await;

    let events = non_detection(&mut events);
    let entered = MonitorEvent::Presence { edge: PresenceEdge::Entered };
    let left = MonitorEvent::Presence { edge: PresenceEdge::Left };
    assert_eq!(events.iter().filter(|e| **e == entered).count(), 1);
    assert_eq!(events.iter().filter(|e| **e == left).count(), 1);

    let recording: Vec<&RecordingEvent> = events
        .iter()
        .filter_map(|e| match e {
            MonitorEvent::Recording { event } => Some(event),
            _ => None,
        })
        .collect();
    assert_eq!(recording.len(), 4, "{:?}", recording);
    assert_eq!(*recording[0], RecordingEvent::Started { session: 1 });
    assert_eq!(*recording[1], RecordingEvent::StopRequested { session: 1 });
    match recording[2] {
        // Started at t=0.2, rider last seen at t=1.2, stopped once 2 s had passed (t=3.3).
        RecordingEvent::Saved { session: 1, clip } => {
            assert_eq!(clip.duration, Duration::from_millis(3100))
        }
        other => panic!("expected saved clip, got {:?}", other),
    }
    assert_eq!(*recording[3], RecordingEvent::Ready { session: 1 });
    assert_eq!(monitor.recording_state(), RecordingState::Idle);
}

#[tokio::test(start_paused = true)]
async fn every_frame_is_released_exactly_once() {
    let released = Arc::new(AtomicUsize::new(0));
    let (mut monitor, _events) = motion_monitor();
    let slot = FrameSlot::new();

    for i in 0..20u32 {
        let counter = Arc::clone(&released);
        let frame = Frame::new(scene(Some(i * 20))).with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        slot.push(frame);
        // Consume only every other frame; the rest are replaced in the slot.
        if i % 2 == 1 {
            let frame = slot.next().await.unwrap();
            monitor.handle_frame(frame).await;
        }
    }
    assert_eq!(slot.stats().dropped, 10);
    assert_eq!(released.load(Ordering::SeqCst), 20);
    assert_eq!(monitor.manager().stats().frames_processed, 10);
}

#[tokio::test(start_paused = true)]
async fn switching_detectors_mid_stream() {
    let (mut monitor, mut events) = motion_monitor();
    monitor.handle_frame(Frame::new(scene(None))).await;

    let mut config = ConfigMap::new();
    config.insert("max_feature_count".into(), ConfigValue::Int(12));
    assert!(monitor.handle_command(MonitorCommand::Configure(config)));
    assert!(monitor.handle_command(MonitorCommand::SwitchDetector(DetectorKind::OpticalFlow)));
    assert_eq!(monitor.manager().active_kind(), Some(DetectorKind::OpticalFlow));

    let result = monitor.handle_frame(Frame::new(scene(Some(200)))).await;
    assert!(!result.rider_detected);
    assert!(result.debug_info.starts_with("first frame"));

    let events = non_detection(&mut events);
    assert!(events.contains(&MonitorEvent::DetectorSwitched {
        detector: DetectorKind::OpticalFlow
    }));
}

#[tokio::test(start_paused = true)]
async fn synthetic_source_drives_monitor_loop() {
    let settings = SourceSettings {
        uri: "stub://lane".into(),
        fps: 10,
        width: 320,
        height: 240,
    };
    let mut source = FrameSource::open(&settings).unwrap();
    source.connect().unwrap();
    let interval = source.interval();

    let mut manager = DetectorManager::new(DetectorKind::Motion, Arc::new(StubPoseEstimator::new()));
    let mut config = ConfigMap::new();
    config.insert("min_motion_area".into(), ConfigValue::Int(300));
    manager.configure(&config);
    let (monitor, mut events) = Monitor::new(
        manager,
        PresenceSettings::default(),
        Arc::new(LoggingBackend::default()),
        ControllerSettings::default(),
    );

    let slot = Arc::new(FrameSlot::new());
    let (_commands, command_rx) = mpsc::unbounded_channel();
    let producer_slot = Arc::clone(&slot);
    let producer = tokio::spawn(async move {
        for _ in 0..120 {
            tokio::time::sleep(interval).await;
            let sample = source.next_frame().unwrap().unwrap();
            producer_slot.push(Frame::new(sample));
        }
        producer_slot.close();
    });

    monitor.run(Arc::clone(&slot), command_rx).await;
    producer.await.unwrap();

    let events = non_detection(&mut events);
    assert!(events.contains(&MonitorEvent::Presence { edge: PresenceEdge::Entered }));
    assert!(events.contains(&MonitorEvent::Recording {
        event: RecordingEvent::Started { session: 1 }
    }));
}
