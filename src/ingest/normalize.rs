use anyhow::{anyhow, Result};

use crate::frame::FrameSample;

/// Raw pixel layouts a producer may hand over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Rgba32,
    Nv12,
}

/// Reduce a raw buffer to the grayscale sample detectors consume.
pub fn to_sample(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<FrameSample> {
    match format {
        PixelFormat::Gray8 => {
            let expected = pixel_count(width, height)?;
            if pixels.len() != expected {
                return Err(anyhow!(
                    "gray frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            FrameSample::from_packed_gray(pixels.to_vec(), width, height)
        }
        PixelFormat::Rgb24 => FrameSample::from_rgb24(pixels, width, height),
        PixelFormat::Rgba32 => {
            let expected = pixel_count(width, height)?
                .checked_mul(4)
                .ok_or_else(|| anyhow!("RGBA frame dimensions overflow"))?;
            if pixels.len() != expected {
                return Err(anyhow!(
                    "RGBA frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            let rgb: Vec<u8> = pixels
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect();
            FrameSample::from_rgb24(&rgb, width, height)
        }
        PixelFormat::Nv12 => FrameSample::from_nv12(pixels, width, height),
    }
}

fn pixel_count(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}
