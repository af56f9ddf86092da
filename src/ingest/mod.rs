//! Frame ingestion sources.
//!
//! - `stub://<name>`: synthetic scene with a rider crossing on a fixed schedule
//! - a local directory path: still images replayed in lexical order
//!
//! Only local sources are accepted. Every source reduces its pixels to a grayscale
//! `FrameSample` through `normalize` before handing it on.

pub mod images;
pub mod normalize;
pub mod synthetic;

use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::config::SourceSettings;
use crate::frame::FrameSample;

pub use images::ImageDirSource;
pub use normalize::PixelFormat;
pub use synthetic::SyntheticSource;

/// Statistics for a frame source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub uri: String,
}

/// Frame producer selected from a source URI.
pub struct FrameSource {
    backend: SourceBackend,
    interval: Duration,
}

enum SourceBackend {
    Synthetic(SyntheticSource),
    Images(ImageDirSource),
}

impl FrameSource {
    pub fn open(settings: &SourceSettings) -> Result<Self> {
        let uri = settings.uri.trim();
        if uri.is_empty() {
            return Err(anyhow!("source uri must not be empty"));
        }
        let backend = if let Some(name) = uri.strip_prefix("stub://") {
            SourceBackend::Synthetic(SyntheticSource::new(
                name,
                settings.width,
                settings.height,
                settings.fps,
            ))
        } else if uri.contains("://") {
            return Err(anyhow!(
                "unsupported source {} (expected stub://<name> or a local image directory)",
                uri
            ));
        } else {
            SourceBackend::Images(ImageDirSource::new(uri))
        };
        Ok(Self {
            backend,
            interval: Duration::from_secs(1) / settings.fps.max(1),
        })
    }

    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            SourceBackend::Synthetic(source) => source.connect(),
            SourceBackend::Images(source) => source.connect(),
        }
    }

    /// Next frame, or `None` when a finite source is exhausted.
    pub fn next_frame(&mut self) -> Result<Option<FrameSample>> {
        match &mut self.backend {
            SourceBackend::Synthetic(source) => source.next_frame().map(Some),
            SourceBackend::Images(source) => source.next_frame(),
        }
    }

    /// Pacing between frames at the configured rate.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stats(&self) -> SourceStats {
        match &self.backend {
            SourceBackend::Synthetic(source) => source.stats(),
            SourceBackend::Images(source) => source.stats(),
        }
    }
}
