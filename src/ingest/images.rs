//! Still-image directory source.
//!
//! Plays the PNG/JPEG files of one local directory in lexical order, decoding each with
//! the `image` crate. Handy for replaying captured footage frame by frame.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;

use super::normalize::{to_sample, PixelFormat};
use super::SourceStats;
use crate::frame::FrameSample;

const EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

pub struct ImageDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    looping: bool,
    frames_captured: u64,
}

impl ImageDirSource {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            files: Vec::new(),
            next: 0,
            looping: false,
            frames_captured: 0,
        }
    }

    /// Start over from the first image instead of ending.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn connect(&mut self) -> Result<()> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read image directory {}", self.dir.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)));
            if is_image {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(anyhow!("no PNG or JPEG images in {}", self.dir.display()));
        }
        files.sort();
        log::info!(
            "ImageDirSource: {} images in {}",
            files.len(),
            self.dir.display()
        );
        self.files = files;
        self.next = 0;
        Ok(())
    }

    /// Decode the next image, or `None` once the directory is exhausted.
    pub fn next_frame(&mut self) -> Result<Option<FrameSample>> {
        if self.next >= self.files.len() {
            if !self.looping || self.files.is_empty() {
                return Ok(None);
            }
            self.next = 0;
        }
        let path = &self.files[self.next];
        self.next += 1;
        let image = image::open(path).with_context(|| format!("failed to decode {}", path.display()))?;
        let sample = decode(image)?;
        self.frames_captured += 1;
        Ok(Some(sample))
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            uri: self.dir.display().to_string(),
        }
    }
}

fn decode(image: DynamicImage) -> Result<FrameSample> {
    let (width, height) = (image.width(), image.height());
    match image {
        DynamicImage::ImageLuma8(buf) => to_sample(buf.as_raw(), width, height, PixelFormat::Gray8),
        DynamicImage::ImageRgb8(buf) => to_sample(buf.as_raw(), width, height, PixelFormat::Rgb24),
        DynamicImage::ImageRgba8(buf) => to_sample(buf.as_raw(), width, height, PixelFormat::Rgba32),
        other => to_sample(other.to_rgb8().as_raw(), width, height, PixelFormat::Rgb24),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    #[test]
    fn plays_images_in_order() {
        let dir = tempfile::tempdir().unwrap();
        GrayImage::from_pixel(8, 6, Luma([10])).save(dir.path().join("b.png")).unwrap();
        GrayImage::from_pixel(8, 6, Luma([200])).save(dir.path().join("a.png")).unwrap();
        RgbImage::from_pixel(8, 6, Rgb([255, 255, 255])).save(dir.path().join("c.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut source = ImageDirSource::new(dir.path());
        source.connect().unwrap();
        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.luma(0, 0), 200);
        assert_eq!(source.next_frame().unwrap().unwrap().luma(3, 3), 10);
        assert_eq!(source.next_frame().unwrap().unwrap().luma(7, 5), 255);
        assert!(source.next_frame().unwrap().is_none());
        assert_eq!(source.stats().frames_captured, 3);
    }

    #[test]
    fn looping_restarts() {
        let dir = tempfile::tempdir().unwrap();
        GrayImage::from_pixel(4, 4, Luma([7])).save(dir.path().join("only.png")).unwrap();
        let mut source = ImageDirSource::new(dir.path()).looping(true);
        source.connect().unwrap();
        for _ in 0..3 {
            assert!(source.next_frame().unwrap().is_some());
        }
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageDirSource::new(dir.path()).connect().is_err());
    }
}
