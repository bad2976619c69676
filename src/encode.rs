//! Output formats and quality-aware encoding.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageError, ImageFormat, RgbImage};

use crate::error::{Error, Result};

/// Encoder selection for cleaned images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Use the input file's own format.
    #[default]
    Keep,
    /// JPEG, quality used directly.
    Jpeg,
    /// PNG, quality mapped to a compression level.
    Png,
    /// WebP, lossless at quality 100 and quantised below.
    Webp,
}

impl OutputFormat {
    /// File extension (without dot) for an explicit format, `None` for
    /// [`OutputFormat::Keep`].
    #[must_use]
    pub const fn extension(self) -> Option<&'static str> {
        match self {
            Self::Keep => None,
            Self::Jpeg => Some("jpg"),
            Self::Png => Some("png"),
            Self::Webp => Some("webp"),
        }
    }

    /// Explicit format implied by a file extension, if we have a tuned encoder for it.
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" | "original" => Ok(Self::Keep),
            other => Self::from_extension(other).ok_or_else(|| Error::UnsupportedFormat(other.to_string())),
        }
    }
}

/// PNG compression level for a 1-100 quality: 100 → 0 (none), 1 → 9 (max).
#[must_use]
pub fn png_compression_level(quality: u8) -> u8 {
    ((100 - quality.clamp(1, 100)) / 10).min(9)
}

/// Save an RGB image with format-specific quality settings.
///
/// With [`OutputFormat::Keep`] the encoder is chosen from `path`'s extension;
/// extensions without a tuned encoder (BMP, GIF, ...) fall back to the
/// `image` crate defaults.
///
/// The image is encoded into a sibling `.partial` file that replaces `path`
/// only once it is complete, so a failed write leaves an existing `path`
/// untouched.
///
/// # Errors
///
/// [`Error::UnsupportedFormat`] if no encoder matches the extension,
/// [`Error::Encode`] if writing fails.
pub fn save_image(img: &RgbImage, path: &Path, format: OutputFormat, quality: u8) -> Result<()> {
    let quality = quality.clamp(1, 100);
    let format = match format {
        OutputFormat::Keep => {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            match OutputFormat::from_extension(ext) {
                Some(format) => format,
                None => {
                    let fallback = ImageFormat::from_path(path)
                        .map_err(|e| Error::UnsupportedFormat(e.to_string()))?;
                    return write_atomically(path, |partial| img.save_with_format(partial, fallback));
                }
            }
        }
        explicit => explicit,
    };

    write_atomically(path, |partial| {
        let mut writer = BufWriter::new(File::create(partial)?);
        let (w, h) = img.dimensions();
        match format {
            OutputFormat::Jpeg => {
                JpegEncoder::new_with_quality(&mut writer, quality).write_image(
                    img.as_raw(),
                    w,
                    h,
                    ExtendedColorType::Rgb8,
                )?;
            }
            OutputFormat::Png => {
                let compression = match png_compression_level(quality) {
                    0 => CompressionType::Uncompressed,
                    level => CompressionType::Level(level),
                };
                PngEncoder::new_with_quality(&mut writer, compression, FilterType::Adaptive)
                    .write_image(img.as_raw(), w, h, ExtendedColorType::Rgb8)?;
            }
            OutputFormat::Webp | OutputFormat::Keep => {
                let mut data = img.as_raw().clone();
                quantize_for_webp(&mut data, quality);
                WebPEncoder::new_lossless(&mut writer).write_image(&data, w, h, ExtendedColorType::Rgb8)?;
            }
        }
        writer.flush()?;
        Ok(())
    })
}

/// `<dir>/.<name>.partial`, next to `path` so the final rename stays on one
/// filesystem.
fn partial_path(path: &Path) -> PathBuf {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    path.with_file_name(format!(".{name}.partial"))
}

fn write_atomically(
    path: &Path,
    write: impl FnOnce(&Path) -> std::result::Result<(), ImageError>,
) -> Result<()> {
    let partial = partial_path(path);
    let written = write(&partial).and_then(|()| std::fs::rename(&partial, path).map_err(ImageError::from));
    written.map_err(|source| {
        let _ = std::fs::remove_file(&partial);
        Error::Encode {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Snap channels to a coarser grid so the lossless encoder produces smaller
/// files at lower qualities.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn quantize_for_webp(data: &mut [u8], quality: u8) {
    if quality >= 100 {
        return;
    }
    let levels = webp_levels_from_quality(quality);
    let step = 255.0 / (f32::from(levels) - 1.0);
    for channel in data.iter_mut() {
        let bucket = (f32::from(*channel) / step).round();
        *channel = (bucket * step).round().clamp(0.0, 255.0) as u8;
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn webp_levels_from_quality(quality: u8) -> u16 {
    if quality >= 100 {
        return 256;
    }
    let normalized = f32::from(quality.clamp(1, 100)) / 100.0;
    (2.0 + normalized * normalized * 254.0).round().clamp(2.0, 256.0) as u16
}
