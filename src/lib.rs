//! Rider presence monitor.
//!
//! This crate watches a camera feed for a rider (someone on a bike, scooter, ...) and
//! drives a recorder from what it sees.
//!
//! # Pipeline
//!
//! ```text
//! FrameSource -> FrameSlot -> Monitor -> DetectorManager -> Detector
//!                                     -> PresenceTracker -> RecordingController
//! ```
//!
//! 1. **Keep only the latest frame**: producers push into a `FrameSlot`; a frame that is
//!    not consumed in time is replaced and released, never queued.
//! 2. **One detector, one call in flight**: the `DetectorManager` owns the active strategy
//!    (pose, motion, optical flow, hybrid) and is itself owned by the monitor task.
//! 3. **Wall-clock thresholds**: cooldown, grace window, and maximum duration are measured
//!    from timestamps, so dropped frames never skew them.
//! 4. **Faults degrade, never halt**: analysis and model failures become negative
//!    results; recording failures pass through an Error state back to Idle.
//!
//! # Module Structure
//!
//! - `frame`: grayscale samples, release-on-drop frame handles, keep-latest slot
//! - `ingest`: synthetic and image-directory sources
//! - `detect`: detector trait, strategies, options, and the manager
//! - `presence`: enter/leave edges and recording requests
//! - `recording`: the recording state machine
//! - `monitor`: the serialized loop tying everything together
//! - `config`: file and environment configuration

pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod monitor;
pub mod presence;
pub mod recording;

pub use config::MonitorConfig;
pub use detect::{DetectionResult, Detector, DetectorKind, DetectorManager};
pub use frame::{Frame, FrameSample, FrameSlot};
pub use monitor::{Monitor, MonitorCommand, MonitorEvent};
pub use presence::{PresenceSettings, PresenceTracker};
pub use recording::{RecordingController, RecordingState};
