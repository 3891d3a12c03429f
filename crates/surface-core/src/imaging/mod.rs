//! Device-specific pixel work.
//!
//! Rendered buttons arrive at whatever size the renderer chose.  Before a
//! driver can send them it has to:
//!
//! 1. Scale to the device's native key size.
//! 2. Rotate by the configured rotation (composed with any mount rotation).
//! 3. Re-encode: raw RGB for Satellite clients, JPEG for Stream Docks.
//!
//! Stream Docks reject key images above a fixed byte budget, so
//! [`encode_jpeg_within_budget`] walks quality down until the image fits.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage, RgbaImage};
use thiserror::Error;
use tracing::warn;

use crate::domain::draw::{PixelBuffer, PixelFormat};
use crate::domain::grid::Rotation;

/// First JPEG quality tried.
pub const JPEG_START_QUALITY: u8 = 90;
/// Quality decrement per attempt.
pub const JPEG_QUALITY_STEP: u8 = 10;
/// Lowest quality tried before truncating.
pub const JPEG_MIN_QUALITY: u8 = 11;

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Converts a [`PixelBuffer`] to an RGB image, dropping alpha.
pub fn to_rgb_image(buf: &PixelBuffer) -> RgbImage {
    let rgb = match buf.format() {
        PixelFormat::Rgb => RgbImage::from_raw(buf.width(), buf.height(), buf.data().to_vec()),
        PixelFormat::Rgba => RgbaImage::from_raw(buf.width(), buf.height(), buf.data().to_vec())
            .map(|rgba| DynamicImage::ImageRgba8(rgba).to_rgb8()),
    };
    // PixelBuffer validates its length, so from_raw cannot fail here.
    rgb.unwrap_or_else(|| RgbImage::new(buf.width(), buf.height()))
}

/// Scales `buf` to `width x height`, then applies `rotation`.
///
/// Empty buffers produce a black image of the target size.
pub fn fit(buf: &PixelBuffer, width: u32, height: u32, rotation: Rotation) -> RgbImage {
    if buf.is_empty() {
        return RgbImage::new(width, height);
    }

    // Rotating by a quarter turn swaps the axes, so scale to the swapped size
    // first and the result comes out at width x height.
    let (scale_w, scale_h) = match rotation {
        Rotation::Clockwise90 | Rotation::CounterClockwise90 => (height, width),
        Rotation::None | Rotation::Rotate180 => (width, height),
    };

    let mut img = to_rgb_image(buf);
    if img.width() != scale_w || img.height() != scale_h {
        img = imageops::resize(&img, scale_w, scale_h, FilterType::Triangle);
    }

    match rotation {
        Rotation::None => img,
        Rotation::Clockwise90 => imageops::rotate90(&img),
        Rotation::CounterClockwise90 => imageops::rotate270(&img),
        Rotation::Rotate180 => imageops::rotate180(&img),
    }
}

/// Raw 24-bit RGB pixels at `width x height`, as carried by Satellite `BITMAP`.
pub fn raw_rgb(buf: &PixelBuffer, width: u32, height: u32, rotation: Rotation) -> Vec<u8> {
    fit(buf, width, height, rotation).into_raw()
}

/// A JPEG produced by [`encode_jpeg_within_budget`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetedJpeg {
    pub data: Vec<u8>,
    /// Quality of the last attempt.
    pub quality: u8,
    /// `true` when even the lowest quality did not fit and the data was cut.
    pub truncated: bool,
}

/// Encodes `img` as JPEG no larger than `budget` bytes.
///
/// Starts at [`JPEG_START_QUALITY`] and steps down by [`JPEG_QUALITY_STEP`]
/// to [`JPEG_MIN_QUALITY`].  If the image still does not fit, the lowest
/// quality result is truncated to `budget` and a data-loss warning is logged.
/// The returned data never exceeds `budget`.
///
/// # Errors
///
/// Returns [`ImagingError::Encode`] if the codec fails.
pub fn encode_jpeg_within_budget(img: &RgbImage, budget: usize) -> Result<BudgetedJpeg, ImagingError> {
    let mut quality = JPEG_START_QUALITY;
    loop {
        let mut data = Vec::new();
        JpegEncoder::new_with_quality(&mut data, quality).encode_image(img)?;

        if data.len() <= budget {
            return Ok(BudgetedJpeg {
                data,
                quality,
                truncated: false,
            });
        }

        if quality <= JPEG_MIN_QUALITY {
            warn!(
                "JPEG still {} bytes at quality {quality}, truncating to {budget} bytes; image will be corrupt",
                data.len()
            );
            data.truncate(budget);
            return Ok(BudgetedJpeg {
                data,
                quality,
                truncated: true,
            });
        }

        quality = quality.saturating_sub(JPEG_QUALITY_STEP).max(JPEG_MIN_QUALITY);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
