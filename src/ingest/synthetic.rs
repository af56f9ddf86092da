//! Synthetic `stub://` scene.
//!
//! A noisy static background with a checkered block (the "rider") that crosses the frame
//! from left to right once per cycle. Deterministic for a given name, so tests and demos
//! see the same sequence every run.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::normalize::{to_sample, PixelFormat};
use super::SourceStats;
use crate::frame::FrameSample;

const CYCLE_SECS: u32 = 10;
const PASS_SECS: u32 = 3;
const CHECKER: u32 = 16;
const NOISE: i16 = 3;

pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    fps: u32,
    with_rider: bool,
    frame_count: u64,
    rng: StdRng,
    background: Vec<u8>,
}

impl SyntheticSource {
    pub fn new(name: &str, width: u32, height: u32, fps: u32) -> Self {
        let mut rng = StdRng::seed_from_u64(seed_for(name));
        let background = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| 60 + ((x / 7 + y / 5) % 24) as u8)
            .map(|v| v.saturating_add(rng.gen_range(0..4)))
            .collect();
        Self {
            name: name.to_string(),
            width,
            height,
            fps: fps.max(1),
            with_rider: true,
            frame_count: 0,
            rng,
            background,
        }
    }

    /// Background only; nothing ever crosses the frame.
    pub fn without_rider(mut self) -> Self {
        self.with_rider = false;
        self
    }

    pub fn connect(&mut self) -> Result<()> {
        log::info!(
            "SyntheticSource: connected to stub://{} ({}x{} @ {} fps)",
            self.name,
            self.width,
            self.height,
            self.fps
        );
        Ok(())
    }

    fn cycle_frames(&self) -> u64 {
        (self.fps * CYCLE_SECS) as u64
    }

    fn pass_frames(&self) -> u64 {
        (self.fps * PASS_SECS) as u64
    }

    fn rider_width(&self) -> u32 {
        (self.width / 4).max(1)
    }

    /// Left edge of the rider block in frame `index`, if it is on screen.
    pub fn rider_left(&self, index: u64) -> Option<i64> {
        if !self.with_rider {
            return None;
        }
        let phase = index % self.cycle_frames();
        // Each cycle starts with a quiet stretch, then the pass.
        let pass_start = self.cycle_frames() - self.pass_frames();
        if phase < pass_start {
            return None;
        }
        let progress = (phase - pass_start) as i64;
        let travel = (self.width + self.rider_width()) as i64;
        let left = -(self.rider_width() as i64) + progress * travel / self.pass_frames() as i64;
        let visible = left < self.width as i64 && left + self.rider_width() as i64 > 0;
        visible.then_some(left)
    }

    pub fn next_frame(&mut self) -> Result<FrameSample> {
        let index = self.frame_count;
        self.frame_count += 1;

        let mut luma = self.background.clone();
        for value in luma.iter_mut() {
            let jitter = self.rng.gen_range(-NOISE..=NOISE);
            *value = (*value as i16 + jitter).clamp(0, 255) as u8;
        }

        if let Some(left) = self.rider_left(index) {
            let top = self.height / 4;
            let bottom = (top + self.height / 2).min(self.height);
            let x0 = left.max(0) as u32;
            let x1 = (left + self.rider_width() as i64).min(self.width as i64) as u32;
            for y in top..bottom {
                for x in x0..x1 {
                    let local_x = (x as i64 - left) as u32;
                    let local_y = y - top;
                    let dark = (local_x / CHECKER + local_y / CHECKER) % 2 == 0;
                    luma[(y * self.width + x) as usize] = if dark { 30 } else { 225 };
                }
            }
        }

        // Producers hand over RGB; tint slightly so the conversion is exercised.
        let rgb: Vec<u8> = luma
            .iter()
            .flat_map(|&v| [v, v, v.saturating_sub(4)])
            .collect();
        to_sample(&rgb, self.width, self.height, PixelFormat::Rgb24)
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            uri: format!("stub://{}", self.name),
        }
    }
}

fn seed_for(name: &str) -> u64 {
    // FNV-1a
    name.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0100_0000_01b3)
    })
}
