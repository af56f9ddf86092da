//! Frame hand-off layer.
//!
//! - `FrameSample`: immutable grayscale intensity buffer (width, height, stride).
//! - `Frame`: owned producer handle around a sample. Its release hook runs exactly once,
//!   when the handle is dropped, on every exit path.
//! - `GrayPlane`: tightly packed working buffer that detectors downscale into.
//! - `FrameSlot`: keep-only-latest hand-off between a producer and the monitor task.
//!
//! Frames are created and discarded inside one processing cycle. Detectors only ever see
//! `&FrameSample`, so they cannot keep the producer's resource alive past `process()`.

use anyhow::{anyhow, Result};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::time::Instant;

// ----------------------------------------------------------------------------
// FrameSample: grayscale intensity buffer
// ----------------------------------------------------------------------------

/// Grayscale intensity buffer derived from a camera frame.
///
/// Cloning is cheap (the pixel buffer is shared) and never duplicates the producer
/// resource: that lives in `Frame`.
#[derive(Clone)]
pub struct FrameSample {
    data: Arc<[u8]>,
    width: u32,
    height: u32,
    stride: u32,
}

impl FrameSample {
    /// Wrap a luma buffer with an explicit row stride.
    pub fn from_gray(data: Vec<u8>, width: u32, height: u32, stride: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero ({}x{})", width, height));
        }
        if stride < width {
            return Err(anyhow!("stride {} is smaller than width {}", stride, width));
        }
        let required = (stride as usize)
            .checked_mul(height as usize - 1)
            .and_then(|v| v.checked_add(width as usize))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() < required {
            return Err(anyhow!(
                "gray frame too short: expected at least {} bytes, got {}",
                required,
                data.len()
            ));
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
            stride,
        })
    }

    /// Tightly packed luma buffer (`stride == width`).
    pub fn from_packed_gray(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        Self::from_gray(data, width, height, width)
    }

    /// Convert an interleaved RGB24 buffer to luma (BT.601 weights).
    pub fn from_rgb24(pixels: &[u8], width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        let luma = pixels
            .chunks_exact(3)
            .map(|px| {
                let weighted = 77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32;
                (weighted >> 8) as u8
            })
            .collect();
        Self::from_packed_gray(luma, width, height)
    }

    /// Take the Y plane of an NV12 buffer; chroma is not needed for detection.
    pub fn from_nv12(pixels: &[u8], width: u32, height: u32) -> Result<Self> {
        let y_plane = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
        let expected = y_plane
            .checked_add(y_plane / 2)
            .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "NV12 frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Self::from_packed_gray(pixels[..y_plane].to_vec(), width, height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Intensity at (x, y). Callers stay in bounds.
    #[inline]
    pub fn luma(&self, x: u32, y: u32) -> u8 {
        self.data[(y * self.stride + x) as usize]
    }

    /// One row of visible pixels (stride padding excluded).
    pub fn row(&self, y: u32) -> &[u8] {
        let start = (y * self.stride) as usize;
        &self.data[start..start + self.width as usize]
    }
}

impl fmt::Debug for FrameSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSample")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Frame: producer handle with exactly-once release
// ----------------------------------------------------------------------------

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Owned frame handle. Not `Clone`: there is exactly one owner, and the release hook runs
/// when that owner drops it.
pub struct Frame {
    sample: FrameSample,
    captured_at: Instant,
    release: Option<ReleaseHook>,
}

impl Frame {
    pub fn new(sample: FrameSample) -> Self {
        Self {
            sample,
            captured_at: Instant::now(),
            release: None,
        }
    }

    /// Attach the producer's release callback (e.g. returning a buffer to a pool).
    pub fn with_release<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.release = Some(Box::new(hook));
        self
    }

    pub fn with_captured_at(mut self, captured_at: Instant) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn sample(&self) -> &FrameSample {
        &self.sample
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Release the producer resource now. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(hook) = self.release.take() {
            hook();
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sample", &self.sample)
            .field("has_release_hook", &self.release.is_some())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// GrayPlane: packed working buffer
// ----------------------------------------------------------------------------

/// Packed grayscale plane used as detector working memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrayPlane {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl GrayPlane {
    pub fn from_fn<F>(width: usize, height: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> u8,
    {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Box-average downscale by an integer factor. A factor of 1 copies the sample.
    pub fn downscaled(sample: &FrameSample, factor: usize) -> Self {
        let factor = factor.max(1);
        let width = (sample.width() as usize / factor).max(1);
        let height = (sample.height() as usize / factor).max(1);
        if factor == 1 {
            return Self::from_fn(width, height, |x, y| sample.luma(x as u32, y as u32));
        }
        let src_w = sample.width() as usize;
        let src_h = sample.height() as usize;
        Self::from_fn(width, height, |x, y| {
            let x0 = x * factor;
            let y0 = y * factor;
            let x1 = (x0 + factor).min(src_w);
            let y1 = (y0 + factor).min(src_h);
            let mut sum = 0u32;
            for sy in y0..y1 {
                let row = sample.row(sy as u32);
                sum += row[x0..x1].iter().map(|&v| v as u32).sum::<u32>();
            }
            let count = ((x1 - x0) * (y1 - y0)).max(1) as u32;
            (sum / count) as u8
        })
    }

    /// Bilinear resample to a fixed working resolution.
    pub fn resampled(sample: &FrameSample, width: usize, height: usize) -> Self {
        let src_w = sample.width() as usize;
        let src_h = sample.height() as usize;
        if src_w == width && src_h == height {
            return Self::downscaled(sample, 1);
        }
        let scale_x = src_w as f32 / width as f32;
        let scale_y = src_h as f32 / height as f32;
        Self::from_fn(width, height, |x, y| {
            let fx = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (src_w - 1) as f32);
            let fy = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (src_h - 1) as f32);
            let x0 = fx.floor() as usize;
            let y0 = fy.floor() as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let y1 = (y0 + 1).min(src_h - 1);
            let tx = fx - x0 as f32;
            let ty = fy - y0 as f32;
            let p = |px: usize, py: usize| sample.luma(px as u32, py as u32) as f32;
            let top = p(x0, y0) * (1.0 - tx) + p(x1, y0) * tx;
            let bottom = p(x0, y1) * (1.0 - tx) + p(x1, y1) * tx;
            (top * (1.0 - ty) + bottom * ty).round().clamp(0.0, 255.0) as u8
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn same_size(&self, other: &GrayPlane) -> bool {
        self.width == other.width && self.height == other.height
    }
}

// ----------------------------------------------------------------------------
// FrameSlot: keep-only-latest hand-off
// ----------------------------------------------------------------------------

#[derive(Default)]
struct SlotState {
    latest: Option<Frame>,
    closed: bool,
    pushed: u64,
    dropped: u64,
}

/// Single-entry mailbox between the frame producer and the monitor.
///
/// A push while a frame is still waiting replaces it; the replaced frame is released
/// and counted as dropped. Frames are never queued.
#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

/// Counters for a `FrameSlot`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub pushed: u64,
    pub dropped: u64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a frame. Returns false (and releases the frame) once the slot is closed.
    pub fn push(&self, frame: Frame) -> bool {
        let replaced = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                drop(state);
                drop(frame);
                return false;
            }
            state.pushed += 1;
            let replaced = state.latest.replace(frame);
            if replaced.is_some() {
                state.dropped += 1;
            }
            replaced
        };
        // Release hooks run outside the lock.
        if replaced.is_some() {
            log::debug!("frame slot: dropped unconsumed frame");
        }
        drop(replaced);
        self.notify.notify_one();
        true
    }

    /// Wait for the next frame. Returns `None` after `close()` once the slot is drained.
    pub async fn next(&self) -> Option<Frame> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(frame) = state.latest.take() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting frames and wake the consumer.
    pub fn close(&self) {
        let pending = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            state.latest.take()
        };
        drop(pending);
        self.notify.notify_one();
    }

    pub fn stats(&self) -> SlotStats {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        SlotStats {
            pushed: state.pushed,
            dropped: state.dropped,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
