//! Alpha blending math for watermark removal.
//!
//! Gemini applies watermarks via forward alpha blending:
//! `watermarked = alpha * logo + (1 - alpha) * original`
//!
//! This module provides the reverse operation to recover original pixels.

use image::RgbImage;

use crate::error::{Error, Result};
use crate::geometry::WatermarkRect;

/// Alpha threshold: ignore pixels with negligible watermark effect (noise).
pub const ALPHA_THRESHOLD: f32 = 0.002;

/// Maximum alpha: clamp to avoid division by near-zero in reverse blending.
pub const MAX_ALPHA: f32 = 0.99;

/// The logo is pure white.
const LOGO_VALUE: f32 = 255.0;

/// Per-pixel opacity of the watermark logo, row-major, values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AlphaMap {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl AlphaMap {
    /// Wrap raw alpha values. Returns `None` if `values.len() != width * height`.
    #[must_use]
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> Option<Self> {
        (values.len() == width as usize * height as usize).then_some(Self {
            width,
            height,
            values,
        })
    }

    /// Derive the alpha map from a capture of the logo on a black background.
    ///
    /// The alpha at each pixel is `max(R, G, B) / 255.0`.
    #[must_use]
    pub fn from_capture(capture: &RgbImage) -> Self {
        let values = capture
            .pixels()
            .map(|px| f32::from(px[0].max(px[1]).max(px[2])) / 255.0)
            .collect();
        Self {
            width: capture.width(),
            height: capture.height(),
            values,
        }
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Alpha at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates are outside the map.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        assert!(x < self.width && y < self.height, "alpha map index out of range");
        self.values[(y * self.width + x) as usize]
    }

    /// All values, row-major.
    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

/// Calculate an alpha map from PNG-encoded capture data.
///
/// # Errors
///
/// Returns [`Error::AlphaMapDecode`] if the PNG data cannot be decoded.
pub fn calculate_alpha_map(png_bytes: &[u8]) -> Result<AlphaMap> {
    let capture = image::load_from_memory(png_bytes)
        .map_err(Error::AlphaMapDecode)?
        .to_rgb8();
    Ok(AlphaMap::from_capture(&capture))
}

/// Reverse-blend a single channel value.
///
/// `alpha` must already be at or above [`ALPHA_THRESHOLD`]; it is clamped to
/// [`MAX_ALPHA`] here. The result is clamped to `[0, 255]` but not rounded.
#[must_use]
pub fn unblend(watermarked: f32, alpha: f32) -> f32 {
    let alpha = alpha.min(MAX_ALPHA);
    ((watermarked - alpha * LOGO_VALUE) / (1.0 - alpha)).clamp(0.0, 255.0)
}

/// Remove the watermark from `image` in place using reverse alpha blending.
///
/// Applies `original = (watermarked - alpha * 255) / (1 - alpha)` to every
/// pixel of `rect` that lies inside the image. The alpha map is aligned with
/// the rectangle's top-left corner. Pixels with alpha below
/// [`ALPHA_THRESHOLD`] and everything outside `rect` are left unchanged.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn remove_watermark_alpha_blend(image: &mut RgbImage, alpha_map: &AlphaMap, rect: WatermarkRect) {
    let img_w = i64::from(image.width());
    let img_h = i64::from(image.height());
    let wm_w = i64::from(rect.width.min(alpha_map.width()));
    let wm_h = i64::from(rect.height.min(alpha_map.height()));

    // Clip to image bounds
    let x1 = rect.x.max(0);
    let y1 = rect.y.max(0);
    let x2 = (rect.x + wm_w).min(img_w);
    let y2 = (rect.y + wm_h).min(img_h);

    if x1 >= x2 || y1 >= y2 {
        return;
    }

    for iy in y1..y2 {
        for ix in x1..x2 {
            let alpha = alpha_map.get((ix - rect.x) as u32, (iy - rect.y) as u32);

            // Skip pixels with negligible watermark effect
            if alpha < ALPHA_THRESHOLD {
                continue;
            }

            let px = image.get_pixel_mut(ix as u32, iy as u32);
            for ch in 0..3 {
                px[ch] = unblend(f32::from(px[ch]), alpha).round() as u8;
            }
        }
    }
}
