use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{imageops, DynamicImage, GrayImage, ImageFormat, Luma};
use std::io::Cursor;
use tracing::debug;

use crate::core::errors::InvalidInput;
use crate::services::engines::ImagePreprocessor;

/// Binary threshold applied after sharpening
pub const DEFAULT_THRESHOLD: u8 = 160;

const SHARPEN_KERNEL: [f32; 9] = [0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0];

/// Grayscale, contrast stretch, sharpen and threshold, then encode as PNG.
///
/// Decoding and filtering run on the blocking pool.
#[derive(Debug, Clone)]
pub struct ImageNormalizer {
    threshold: u8,
}

impl ImageNormalizer {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_THRESHOLD)
    }

    pub fn with_threshold(threshold: u8) -> Self {
        Self { threshold }
    }
}

impl Default for ImageNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImagePreprocessor for ImageNormalizer {
    async fn preprocess(&self, image: &[u8]) -> Result<Vec<u8>> {
        let bytes = image.to_vec();
        let threshold = self.threshold;
        tokio::task::spawn_blocking(move || normalize(&bytes, threshold))
            .await
            .context("Failed to spawn blocking task for image normalization")?
    }
}

fn normalize(bytes: &[u8], threshold: u8) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| InvalidInput(format!("image could not be decoded: {}", e)))?;
    let gray = stretch_contrast(img.to_luma8());
    let sharpened = sharpen(&gray);

    let (width, height) = sharpened.dimensions();
    let binary = GrayImage::from_fn(width, height, |x, y| {
        if sharpened.get_pixel(x, y)[0] >= threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    debug!("Normalized {}x{} image", width, height);

    let mut png_bytes = Vec::new();
    DynamicImage::ImageLuma8(binary)
        .write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
        .context("Failed to encode normalized image as PNG")?;
    Ok(png_bytes)
}

/// 3x3 sharpen with edge pixels replicated, so the border is filtered like the interior.
fn sharpen(gray: &GrayImage) -> GrayImage {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return gray.clone();
    }
    let padded = GrayImage::from_fn(width + 2, height + 2, |x, y| {
        let sx = x.saturating_sub(1).min(width - 1);
        let sy = y.saturating_sub(1).min(height - 1);
        *gray.get_pixel(sx, sy)
    });
    let filtered: GrayImage = imageops::filter3x3(&padded, &SHARPEN_KERNEL);
    imageops::crop_imm(&filtered, 1, 1, width, height).to_image()
}

/// Map the darkest pixel to 0 and the brightest to 255.
fn stretch_contrast(mut gray: GrayImage) -> GrayImage {
    let (lo, hi) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if hi <= lo {
        return gray;
    }
    let range = (hi - lo) as u32;
    for pixel in gray.pixels_mut() {
        pixel[0] = ((pixel[0] - lo) as u32 * 255 / range) as u8;
    }
    gray
}
