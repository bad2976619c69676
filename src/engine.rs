//! Core watermark removal engine.

use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageReader, RgbImage};
use tracing::debug;

use crate::alpha_maps::{self, AlphaMapProvider};
use crate::blending;
use crate::encode::{self, OutputFormat};
use crate::error::{Error, Result};
use crate::geometry::{self, WatermarkInfo};

/// Quality used when the caller does not pick one.
pub const DEFAULT_QUALITY: u8 = 95;

/// The watermark engine holding the alpha map cache.
///
/// Create once and share (for example behind an `Arc`) between the batch
/// processor and the folder monitor. Alpha maps are loaded on first use.
#[derive(Debug)]
pub struct WatermarkEngine {
    alpha_maps: AlphaMapProvider,
}

impl WatermarkEngine {
    /// Engine reading reference captures from `assets_dir`.
    pub fn new(assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            alpha_maps: AlphaMapProvider::new(assets_dir),
        }
    }

    /// Engine using [`alpha_maps::default_assets_dir`].
    #[must_use]
    pub fn with_default_assets() -> Self {
        Self::new(alpha_maps::default_assets_dir())
    }

    /// The alpha map cache.
    #[must_use]
    pub const fn alpha_maps(&self) -> &AlphaMapProvider {
        &self.alpha_maps
    }

    /// Remove the watermark from an image in place.
    ///
    /// Returns where the watermark was assumed to be.
    ///
    /// # Errors
    ///
    /// Fails only if the alpha map for the selected size cannot be loaded.
    pub fn remove(&self, image: &mut RgbImage) -> Result<WatermarkInfo> {
        let info = geometry::watermark_info(image.width(), image.height());
        let alpha_map = self.alpha_maps.get_alpha_map(info.config.logo_size)?;

        debug!(
            width = image.width(),
            height = image.height(),
            logo_size = info.config.logo_size,
            x = info.rect.x,
            y = info.rect.y,
            "removing watermark"
        );
        blending::remove_watermark_alpha_blend(image, &alpha_map, info.rect);
        Ok(info)
    }

    /// Convert any decoded image to RGB and remove the watermark.
    ///
    /// # Errors
    ///
    /// See [`WatermarkEngine::remove`].
    pub fn remove_from_image(&self, image: DynamicImage) -> Result<RgbImage> {
        let mut rgb = match image {
            DynamicImage::ImageRgb8(rgb) => rgb,
            other => other.to_rgb8(),
        };
        self.remove(&mut rgb)?;
        Ok(rgb)
    }

    /// Load `input`, remove the watermark and save it.
    ///
    /// Without `output` the result goes to [`default_output_path`]. The file is
    /// encoded from its extension at [`DEFAULT_QUALITY`].
    ///
    /// # Errors
    ///
    /// Any of the per-file errors from [`open_image`], alpha map errors, or
    /// encoding errors.
    pub fn remove_from_file(&self, input: &Path, output: Option<&Path>) -> Result<PathBuf> {
        let output = output.map_or_else(|| default_output_path(input), Path::to_path_buf);
        let cleaned = self.remove_from_image(open_image(input)?)?;

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        encode::save_image(&cleaned, &output, OutputFormat::Keep, DEFAULT_QUALITY)?;
        Ok(output)
    }
}

/// Check that `path` is an existing, non-empty regular file and return its size.
///
/// # Errors
///
/// [`Error::MissingFile`] (also for directories), [`Error::EmptyFile`], or
/// [`Error::Io`] if the metadata cannot be read.
pub fn check_input_file(path: &Path) -> Result<u64> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return Err(Error::MissingFile(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    match meta.len() {
        0 => Err(Error::EmptyFile(path.to_path_buf())),
        len => Ok(len),
    }
}

/// Open and decode an image, distinguishing missing, empty and undecodable files.
///
/// # Errors
///
/// The errors of [`check_input_file`], plus [`Error::Decode`].
pub fn open_image(path: &Path) -> Result<DynamicImage> {
    check_input_file(path)?;

    ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|source| Error::Decode {
            path: path.to_path_buf(),
            source,
        })
}

/// Generate a default output path from an input path.
///
/// Example: `"photo.jpg"` becomes `"photo_no_watermark.jpg"`.
#[must_use]
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    let parent = input.parent().unwrap_or(Path::new("."));
    match input.extension() {
        Some(ext) => parent.join(format!("{stem}_no_watermark.{}", ext.to_string_lossy())),
        None => parent.join(format!("{stem}_no_watermark")),
    }
}
