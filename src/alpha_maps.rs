//! Loading and caching of the reference alpha maps.
//!
//! Each logo size has a capture `bg_<size>.png` in the assets directory. A
//! capture is decoded the first time its size is requested and kept for the
//! lifetime of the provider.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::blending::{self, AlphaMap};
use crate::error::{Error, Result};
use crate::geometry::WatermarkSize;

/// Directory of the captures, relative to the install location.
pub const ASSETS_SUBDIR: &str = "assets/gemini_watermark";

/// File name of the capture for a logo size.
#[must_use]
pub fn asset_file_name(size: WatermarkSize) -> String {
    format!("bg_{}.png", size.logo_size())
}

/// Default assets directory.
///
/// `assets/gemini_watermark` next to the running executable if it exists,
/// otherwise relative to the current working directory.
#[must_use]
pub fn default_assets_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(ASSETS_SUBDIR)))
        .filter(|dir| dir.is_dir())
        .unwrap_or_else(|| PathBuf::from(ASSETS_SUBDIR))
}

/// Lazily loads one [`AlphaMap`] per logo size and hands out shared copies.
///
/// Safe to share between threads: concurrent first requests for the same size
/// load the capture once, later reads do not lock.
#[derive(Debug)]
pub struct AlphaMapProvider {
    assets_dir: PathBuf,
    small: OnceCell<Arc<AlphaMap>>,
    large: OnceCell<Arc<AlphaMap>>,
}

impl AlphaMapProvider {
    /// Provider reading captures from `assets_dir`. Nothing is loaded yet.
    pub fn new(assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            assets_dir: assets_dir.into(),
            small: OnceCell::new(),
            large: OnceCell::new(),
        }
    }

    /// Directory captures are read from.
    #[must_use]
    pub fn assets_dir(&self) -> &Path {
        &self.assets_dir
    }

    /// Alpha map for a logo side length (48 or 96).
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedSize`] for any other size, [`Error::AssetMissing`]
    /// if the capture or its directory is absent, [`Error::AlphaMapDecode`] or
    /// [`Error::AlphaMapDimensions`] if the capture is malformed.
    pub fn get_alpha_map(&self, size: u32) -> Result<Arc<AlphaMap>> {
        let preset = WatermarkSize::from_logo_size(size).ok_or(Error::UnsupportedSize(size))?;
        self.get(preset)
    }

    /// Alpha map for a preset. See [`AlphaMapProvider::get_alpha_map`].
    ///
    /// # Errors
    ///
    /// Same as [`AlphaMapProvider::get_alpha_map`], minus the size check.
    pub fn get(&self, size: WatermarkSize) -> Result<Arc<AlphaMap>> {
        let cell = match size {
            WatermarkSize::Small => &self.small,
            WatermarkSize::Large => &self.large,
        };
        cell.get_or_try_init(|| self.load(size).map(Arc::new))
            .cloned()
    }

    /// Load both captures now so installation problems show up early.
    ///
    /// # Errors
    ///
    /// The first error encountered, as for [`AlphaMapProvider::get`].
    pub fn warm_up(&self) -> Result<()> {
        self.get(WatermarkSize::Small)?;
        self.get(WatermarkSize::Large)?;
        Ok(())
    }

    fn load(&self, size: WatermarkSize) -> Result<AlphaMap> {
        if !self.assets_dir.is_dir() {
            return Err(Error::AssetMissing {
                path: self.assets_dir.clone(),
            });
        }
        let path = self.assets_dir.join(asset_file_name(size));
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::AssetMissing { path });
            }
            Err(e) => return Err(e.into()),
        };

        let map = blending::calculate_alpha_map(&bytes)?;
        let expected = size.logo_size();
        if map.width() != expected || map.height() != expected {
            return Err(Error::AlphaMapDimensions {
                size: expected,
                width: map.width(),
                height: map.height(),
            });
        }

        debug!(path = %path.display(), size = expected, "loaded alpha map");
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn write_capture(dir: &Path, name: &str, side: u32) {
        RgbImage::from_pixel(side, side, image::Rgb([0, 102, 51]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn loads_and_caches_per_size() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(dir.path(), "bg_48.png", 48);
        let provider = AlphaMapProvider::new(dir.path());

        let first = provider.get_alpha_map(48).unwrap();
        assert_eq!((first.width(), first.height()), (48, 48));
        assert!((first.get(0, 0) - 0.4).abs() < 1e-6);

        // A cached map survives removal of the asset.
        std::fs::remove_file(dir.path().join("bg_48.png")).unwrap();
        let second = provider.get_alpha_map(48).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unsupported_size_is_rejected() {
        let provider = AlphaMapProvider::new("does-not-matter");
        assert!(matches!(
            provider.get_alpha_map(64),
            Err(Error::UnsupportedSize(64))
        ));
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let provider = AlphaMapProvider::new(&missing);
        match provider.get_alpha_map(48) {
            Err(Error::AssetMissing { path }) => assert_eq!(path, missing),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(dir.path(), "bg_48.png", 48);
        let provider = AlphaMapProvider::new(dir.path());
        match provider.get_alpha_map(96) {
            Err(Error::AssetMissing { path }) => assert!(path.ends_with("bg_96.png")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(provider.warm_up().is_err());
    }

    #[test]
    fn wrong_dimensions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(dir.path(), "bg_96.png", 48);
        let provider = AlphaMapProvider::new(dir.path());
        assert!(matches!(
            provider.get_alpha_map(96),
            Err(Error::AlphaMapDimensions { size: 96, .. })
        ));
    }

    #[test]
    fn concurrent_first_use_shares_one_map() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(dir.path(), "bg_96.png", 96);
        let provider = AlphaMapProvider::new(dir.path());

        let maps: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| provider.get_alpha_map(96).unwrap())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for map in &maps[1..] {
            assert!(Arc::ptr_eq(&maps[0], map));
        }
    }
}
