//! Error types for the gemini-watermark-remover crate.

use std::path::PathBuf;

/// Errors that can occur while removing watermarks or watching a folder.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A reference capture (or the directory holding it) does not exist.
    #[error("watermark asset not found: {}", path.display())]
    AssetMissing {
        /// The missing file or directory.
        path: PathBuf,
    },

    /// Failed to decode a reference capture PNG.
    #[error("failed to decode alpha map PNG: {0}")]
    AlphaMapDecode(image::ImageError),

    /// A reference capture does not match the logo size it was loaded for.
    #[error("alpha map for {size}px logo is {width}x{height}, expected {size}x{size}")]
    AlphaMapDimensions {
        /// Logo size the capture was requested for.
        size: u32,
        /// Actual capture width.
        width: u32,
        /// Actual capture height.
        height: u32,
    },

    /// Only 48px and 96px logos exist.
    #[error("unsupported watermark size: {0} (only 48 and 96 are supported)")]
    UnsupportedSize(u32),

    /// The input file does not exist.
    #[error("file not found: {}", .0.display())]
    MissingFile(PathBuf),

    /// The input file exists but has zero length.
    #[error("file is empty: {}", .0.display())]
    EmptyFile(PathBuf),

    /// The input file could not be decoded as an image.
    #[error("unrecognized image format: {source}")]
    Decode {
        /// File that failed to decode.
        path: PathBuf,
        /// Decoder error.
        source: image::ImageError,
    },

    /// Writing the cleaned image failed.
    #[error("failed to write {}: {source}", path.display())]
    Encode {
        /// Output path that could not be written.
        path: PathBuf,
        /// Encoder error.
        source: image::ImageError,
    },

    /// The image format is not supported.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// The directory to watch does not exist.
    #[error("watch directory does not exist: {}", .0.display())]
    WatchDirMissing(PathBuf),

    /// The OS file-watch facility refused the subscription.
    #[error("failed to watch directory: {0}")]
    WatchSubscription(#[from] notify::Error),

    /// An I/O error occurred while reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error occurred during image processing (load, save, encode).
    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    /// Whether the error comes from a broken installation rather than a bad
    /// input file. Such errors affect every removal until the assets are
    /// fixed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AssetMissing { .. }
                | Self::AlphaMapDecode(_)
                | Self::AlphaMapDimensions { .. }
                | Self::UnsupportedSize(_)
        )
    }
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
