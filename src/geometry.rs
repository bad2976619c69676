//! Where the watermark sits for a given image size.
//!
//! Gemini uses exactly two presets. Images larger than 1024px on *both* axes
//! carry a 96x96 logo 64px from the bottom-right corner; everything else
//! (including 1024x1024) carries a 48x48 logo 32px from the corner.

/// Dimension both axes must strictly exceed for the large preset.
const LARGE_THRESHOLD: u32 = 1024;

/// Watermark size classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatermarkSize {
    /// 48x48 watermark, 32px margin (images where either dimension <= 1024).
    Small,
    /// 96x96 watermark, 64px margin (images where both dimensions > 1024).
    Large,
}

impl WatermarkSize {
    /// Side length of the logo in pixels.
    #[must_use]
    pub const fn logo_size(self) -> u32 {
        match self {
            Self::Small => 48,
            Self::Large => 96,
        }
    }

    /// Preset for a logo side length, if one exists.
    #[must_use]
    pub const fn from_logo_size(size: u32) -> Option<Self> {
        match size {
            48 => Some(Self::Small),
            96 => Some(Self::Large),
            _ => None,
        }
    }

    /// Full placement preset for this size.
    #[must_use]
    pub const fn config(self) -> WatermarkConfig {
        match self {
            Self::Small => WatermarkConfig {
                logo_size: 48,
                margin_right: 32,
                margin_bottom: 32,
            },
            Self::Large => WatermarkConfig {
                logo_size: 96,
                margin_right: 64,
                margin_bottom: 64,
            },
        }
    }
}

/// Logo size and distance from the bottom-right corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkConfig {
    /// Side length of the square logo.
    pub logo_size: u32,
    /// Gap between the logo and the right edge.
    pub margin_right: u32,
    /// Gap between the logo and the bottom edge.
    pub margin_bottom: u32,
}

impl WatermarkConfig {
    /// The preset this config belongs to.
    #[must_use]
    pub const fn size(&self) -> Option<WatermarkSize> {
        WatermarkSize::from_logo_size(self.logo_size)
    }
}

/// Footprint of the watermark inside an image.
///
/// `x`/`y` are signed: for images smaller than the footprint the rectangle
/// starts outside the image and only the overlapping part is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkRect {
    /// Left edge.
    pub x: i64,
    /// Top edge.
    pub y: i64,
    /// Width in pixels (equal to the logo size).
    pub width: u32,
    /// Height in pixels (equal to the logo size).
    pub height: u32,
}

/// Config and rectangle for one image size, handy for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkInfo {
    /// Selected preset.
    pub config: WatermarkConfig,
    /// Resulting footprint.
    pub rect: WatermarkRect,
}

/// Pick the watermark preset for an image.
#[must_use]
pub fn detect_config(width: u32, height: u32) -> WatermarkConfig {
    if width > LARGE_THRESHOLD && height > LARGE_THRESHOLD {
        WatermarkSize::Large.config()
    } else {
        WatermarkSize::Small.config()
    }
}

/// Compute the watermark footprint for an image and preset.
#[must_use]
pub fn compute_rect(width: u32, height: u32, config: &WatermarkConfig) -> WatermarkRect {
    let x = i64::from(width) - i64::from(config.margin_right) - i64::from(config.logo_size);
    let y = i64::from(height) - i64::from(config.margin_bottom) - i64::from(config.logo_size);
    WatermarkRect {
        x,
        y,
        width: config.logo_size,
        height: config.logo_size,
    }
}

/// [`detect_config`] followed by [`compute_rect`].
#[must_use]
pub fn watermark_info(width: u32, height: u32) -> WatermarkInfo {
    let config = detect_config(width, height);
    let rect = compute_rect(width, height, &config);
    WatermarkInfo { config, rect }
}
