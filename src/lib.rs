//! Remove visible Gemini AI watermarks via reverse alpha blending.
//!
//! Gemini AI overlays a semi-transparent white star/sparkle logo on generated
//! images. This crate reverses the alpha-blending equation to recover the
//! original pixels, using calibrated 48x48 and 96x96 reference captures loaded
//! from an assets directory (`bg_48.png`, `bg_96.png`).
//!
//! Three ways in:
//!
//! - [`WatermarkEngine`] for single images or files,
//! - [`BatchProcessor`] for an ordered list of files with progress events and
//!   an overwrite prompt,
//! - [`FileMonitor`] to clean `Gemini_Generated_Image*` files as they land in
//!   a folder, archiving the originals.
//!
//! # Quick Start
//!
//! ```no_run
//! use gemini_watermark_remover::WatermarkEngine;
//!
//! let engine = WatermarkEngine::new("assets/gemini_watermark");
//! let mut img = image::open("photo.jpg").unwrap().to_rgb8();
//! engine.remove(&mut img).expect("alpha maps available");
//! img.save("cleaned.jpg").unwrap();
//! ```
//!
//! # Watching a folder
//!
//! ```no_run
//! use std::sync::Arc;
//! use gemini_watermark_remover::{FileMonitor, MonitorEvent, MonitorOptions, WatermarkEngine};
//!
//! let engine = Arc::new(WatermarkEngine::with_default_assets());
//! let (mut monitor, events) = FileMonitor::new(engine, MonitorOptions::default());
//! monitor.start_monitoring("/home/me/Downloads").unwrap();
//! for event in events {
//!     if let MonitorEvent::FileProcessed { output, .. } = event {
//!         println!("cleaned {}", output.display());
//!     }
//! }
//! ```

#![deny(missing_docs)]

pub mod alpha_maps;
pub mod batch;
pub mod blending;
pub mod encode;
mod engine;
pub mod error;
pub mod geometry;
pub mod watch;

pub use alpha_maps::AlphaMapProvider;
pub use batch::{BatchEvent, BatchHandle, BatchOptions, BatchProcessor, BatchReport, ProcessingResult};
pub use blending::AlphaMap;
pub use encode::OutputFormat;
pub use engine::{check_input_file, default_output_path, open_image, WatermarkEngine, DEFAULT_QUALITY};
pub use error::{Error, Result};
pub use geometry::{
    compute_rect, detect_config, WatermarkConfig, WatermarkInfo, WatermarkRect, WatermarkSize,
};
pub use watch::{FileMonitor, MonitorEvent, MonitorOptions};
