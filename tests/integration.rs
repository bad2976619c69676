use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gemini_watermark_remover::{
    watch, BatchEvent, BatchOptions, BatchProcessor, Error, FileMonitor, MonitorEvent,
    MonitorOptions, OutputFormat, ProcessingResult, WatermarkEngine, WatermarkSize,
};
use image::{Rgb, RgbImage};

/// Star-ish capture: bright in the middle, fading to zero at the border,
/// never brighter than half opacity.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn capture(side: u32) -> RgbImage {
    let c = (side as f32 - 1.0) / 2.0;
    RgbImage::from_fn(side, side, |x, y| {
        let d = ((x as f32 - c).abs() + (y as f32 - c).abs()) / side as f32;
        let v = ((1.0 - 2.0 * d).max(0.0) * 127.0) as u8;
        Rgb([v, v / 2, v / 3])
    })
}

fn write_assets(dir: &Path) -> PathBuf {
    let assets = dir.join("assets");
    std::fs::create_dir_all(&assets).unwrap();
    for side in [48, 96] {
        capture(side).save(assets.join(format!("bg_{side}.png"))).unwrap();
    }
    assets
}

fn engine(dir: &Path) -> Arc<WatermarkEngine> {
    Arc::new(WatermarkEngine::new(write_assets(dir)))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn watermark(img: &mut RgbImage, logo: &RgbImage, x: u32, y: u32) {
    for (dx, dy, px) in logo.enumerate_pixels() {
        let alpha = f32::from(px.0.into_iter().max().unwrap()) / 255.0;
        let target = img.get_pixel_mut(x + dx, y + dy);
        for ch in 0..3 {
            let blended = alpha * 255.0 + (1.0 - alpha) * f32::from(target[ch]);
            target[ch] = blended.round() as u8;
        }
    }
}

fn textured(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 251) as u8, (y % 241) as u8, ((x + y) % 199) as u8])
    })
}

fn wait_for<T>(rx: &Receiver<MonitorEvent>, timeout: Duration, mut pick: impl FnMut(&MonitorEvent) -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(event) => {
                if let Some(found) = pick(&event) {
                    return Some(found);
                }
            }
            Err(_) => return None,
        }
    }
    None
}

#[test]
fn engine_loads_both_alpha_maps() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    assert!(engine.alpha_maps().warm_up().is_ok());
    let large = engine.alpha_maps().get(WatermarkSize::Large).unwrap();
    assert_eq!((large.width(), large.height()), (96, 96));
}

#[test]
fn remove_does_not_crash_on_blank_image() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let mut img = RgbImage::new(200, 200);
    engine.remove(&mut img).unwrap();
    assert!(img.pixels().all(|p| p.0 == [0, 0, 0]));
}

#[test]
fn remove_does_not_crash_on_tiny_image() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let mut img = RgbImage::from_pixel(16, 16, Rgb([200, 200, 200]));
    engine.remove(&mut img).unwrap();
}

#[test]
fn watermarked_images_are_restored() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());

    for (w, h, side, margin) in [(2000, 1500, 96, 64), (800, 600, 48, 32)] {
        let original = textured(w, h);
        let mut img = original.clone();
        watermark(&mut img, &capture(side), w - margin - side, h - margin - side);
        assert_ne!(img, original);

        engine.remove(&mut img).unwrap();
        for (restored, orig) in img.pixels().zip(original.pixels()) {
            for ch in 0..3 {
                let diff = (i32::from(restored[ch]) - i32::from(orig[ch])).abs();
                assert!(diff <= 1, "{w}x{h}: restored={restored:?} orig={orig:?}");
            }
        }
    }
}

#[test]
fn batch_reports_missing_empty_and_success() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let inputs = dir.path().join("in");
    std::fs::create_dir_all(&inputs).unwrap();

    let missing = inputs.join("missing.png");
    let valid = inputs.join("valid.png");
    textured(2000, 2000).save(&valid).unwrap();
    let empty = inputs.join("empty.png");
    std::fs::write(&empty, b"").unwrap();

    let out = dir.path().join("out");
    let options = BatchOptions {
        output_dir: out.clone(),
        format: OutputFormat::Keep,
        quality: 90,
    };
    let handle = BatchProcessor::spawn(engine, vec![missing.clone(), valid.clone(), empty.clone()], options).unwrap();

    let mut progress = Vec::new();
    let mut report = None;
    for event in handle.events() {
        match event {
            BatchEvent::Progress(p) => progress.push(p),
            BatchEvent::Finished(r) => report = Some(r),
            BatchEvent::OverwriteRequested(_) => handle.set_overwrite_allowed(true),
            BatchEvent::Status(_) => {}
            BatchEvent::Error(e) => panic!("unexpected error: {e}"),
        }
    }
    handle.join().unwrap();

    assert_eq!(progress, vec![33, 66, 100]);
    let report = report.unwrap();
    assert_eq!(report.results.len(), 3);
    let inputs: Vec<_> = report.results.iter().map(ProcessingResult::input).collect();
    assert_eq!(inputs, vec![missing.as_path(), valid.as_path(), empty.as_path()]);

    assert_eq!(report.failures().count(), 2);
    assert_eq!(report.successes().count(), 1);
    match &report.results[1] {
        ProcessingResult::Success {
            output, file_size, ..
        } => {
            assert!(output.starts_with(&out));
            let name = output.file_name().unwrap().to_string_lossy();
            assert!(name.starts_with("valid_no_watermark_"));
            assert!(name.ends_with(".png"));
            assert_eq!(std::fs::metadata(output).unwrap().len(), *file_size);
        }
        other => panic!("expected success, got {other:?}"),
    }

    let summary = report.failure_summary.unwrap();
    assert!(summary.contains("- missing.png: file not found"));
    assert!(summary.contains("- empty.png: file is empty"));
}

#[test]
fn batch_reports_undecodable_files_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let processor = BatchProcessor::new(engine(dir.path()));
    let bogus = dir.path().join("bogus.jpg");
    std::fs::write(&bogus, b"this is not a jpeg").unwrap();
    let good = dir.path().join("good.jpg");
    textured(300, 200).save(&good).unwrap();

    let options = BatchOptions {
        output_dir: dir.path().join("out"),
        format: OutputFormat::Webp,
        quality: 80,
    };
    let (tx, _rx) = mpsc::channel();
    let report = processor.run(&[bogus, good], &options, &tx).unwrap();

    assert!(matches!(
        &report.results[0],
        ProcessingResult::Failure { reason, .. } if reason.starts_with("unrecognized image format")
    ));
    match &report.results[1] {
        ProcessingResult::Success { output, .. } => {
            assert_eq!(output.extension().unwrap(), "webp");
            assert_eq!(image::open(output).unwrap().width(), 300);
        }
        other => panic!("expected success, got {other:?}"),
    }
}

/// Occupy every output name the next batch could pick.
fn occupy_outputs(out: &Path, stem: &str, ext: &str) -> Vec<PathBuf> {
    std::fs::create_dir_all(out).unwrap();
    let now = chrono::Local::now();
    (-2..30)
        .map(|s| {
            let ts = (now + chrono::Duration::seconds(s)).format("%Y%m%d%H%M%S");
            let path = out.join(format!("{stem}_no_watermark_{ts}.{ext}"));
            std::fs::write(&path, b"keep me").unwrap();
            path
        })
        .collect()
}

#[test]
fn batch_skips_when_overwrite_denied() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("photo.png");
    textured(120, 120).save(&input).unwrap();
    let out = dir.path().join("out");
    let occupied = occupy_outputs(&out, "photo", "png");

    let handle = BatchProcessor::spawn(engine(dir.path()), vec![input], BatchOptions::new(&out)).unwrap();
    let mut asked = 0;
    let mut report = None;
    for event in handle.events() {
        match event {
            BatchEvent::OverwriteRequested(path) => {
                assert!(occupied.contains(&path));
                asked += 1;
                handle.set_overwrite_allowed(false);
            }
            BatchEvent::Finished(r) => report = Some(r),
            _ => {}
        }
    }
    handle.join().unwrap();

    assert_eq!(asked, 1);
    let report = report.unwrap();
    assert!(report.results.is_empty());
    assert!(report.failure_summary.is_none());
    for path in occupied {
        assert_eq!(std::fs::read(path).unwrap(), b"keep me");
    }
}

#[test]
fn batch_overwrites_when_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("photo.png");
    textured(120, 120).save(&input).unwrap();
    let out = dir.path().join("out");
    occupy_outputs(&out, "photo", "png");

    let handle = BatchProcessor::spawn(engine(dir.path()), vec![input], BatchOptions::new(&out)).unwrap();
    let mut report = None;
    for event in handle.events() {
        match event {
            BatchEvent::OverwriteRequested(_) => handle.set_overwrite_allowed(true),
            BatchEvent::Finished(r) => report = Some(r),
            _ => {}
        }
    }
    handle.join().unwrap();

    match &report.unwrap().results[0] {
        ProcessingResult::Success { output, .. } => {
            assert_eq!(image::open(output).unwrap().width(), 120);
        }
        other => panic!("expected success, got {other:?}"),
    }
}

#[test]
fn batch_completes_without_assets() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.png");
    let input = dir.path().join("photo.png");
    textured(120, 120).save(&input).unwrap();
    let processor = BatchProcessor::new(Arc::new(WatermarkEngine::new(dir.path().join("no-assets"))));

    let (tx, rx) = mpsc::channel();
    let report = processor
        .run(
            &[missing.clone(), input.clone(), input],
            &BatchOptions::new(dir.path().join("out")),
            &tx,
        )
        .unwrap();

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.failures().count(), 3);
    assert!(matches!(
        &report.results[0],
        ProcessingResult::Failure { input, reason } if input == &missing && reason.starts_with("file not found")
    ));
    for result in &report.results[1..] {
        assert!(matches!(
            result,
            ProcessingResult::Failure { reason, .. } if reason.starts_with("watermark asset not found")
        ));
    }
    assert!(report.failure_summary.unwrap().starts_with("3 file(s) failed:"));

    let events: Vec<_> = rx.try_iter().collect();
    let progress: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            BatchEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![33, 66, 100]);
    assert!(!events.iter().any(|e| matches!(e, BatchEvent::Error(_))));
    assert!(matches!(events.last(), Some(BatchEvent::Finished(_))));
}

#[test]
fn batch_stops_when_output_dir_cannot_be_created() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();
    let processor = BatchProcessor::new(engine(dir.path()));

    let (tx, rx) = mpsc::channel();
    let err = processor
        .run(&[dir.path().join("a.png")], &BatchOptions::new(blocker.join("out")), &tx)
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    let events: Vec<_> = rx.try_iter().collect();
    assert!(matches!(events.as_slice(), [BatchEvent::Error(_)]));
}

#[test]
fn monitor_cleans_archives_and_ignores_repeats() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let watched = dir.path().join("downloads");
    std::fs::create_dir_all(&watched).unwrap();

    let options = MonitorOptions {
        debounce: Duration::from_millis(300),
        poll_interval: Duration::from_millis(20),
    };
    let (mut monitor, events) = FileMonitor::new(engine, options);
    monitor.start_monitoring(&watched).unwrap();
    assert!(monitor.is_running());
    assert_eq!(monitor.watch_dir(), Some(watched.as_path()));

    let original = watched.join("Gemini_Generated_Image_42.png");
    textured(400, 300).save(&original).unwrap();
    // Not a Gemini file: must be left alone.
    textured(64, 64).save(watched.join("holiday.png")).unwrap();

    let (reported, output) = wait_for(&events, Duration::from_secs(10), |e| match e {
        MonitorEvent::FileProcessed { original, output } => Some((original.clone(), output.clone())),
        _ => None,
    })
    .expect("file was not processed");

    assert_eq!(reported, original);
    let name = output.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("Clean_42_") && name.ends_with(".png"), "{name}");
    assert_eq!(output.parent(), Some(watched.as_path()));
    assert_eq!(image::open(&output).unwrap().width(), 400);
    assert!(!original.exists());
    assert!(watched
        .join(watch::ARCHIVE_FOLDER_NAME)
        .join("Gemini_Generated_Image_42.png")
        .exists());
    assert!(watched.join("holiday.png").exists());

    // Same path again: already processed this session.
    textured(400, 300).save(&original).unwrap();
    let again = wait_for(&events, Duration::from_secs(2), |e| match e {
        MonitorEvent::FileProcessed { original: o, .. } if o == &original => Some(()),
        _ => None,
    });
    assert!(again.is_none());
    assert!(original.exists());

    monitor.stop_monitoring();
    assert!(!monitor.is_running());
    let stopped = wait_for(&events, Duration::from_secs(1), |e| {
        matches!(e, MonitorEvent::MonitoringStopped).then_some(())
    });
    assert!(stopped.is_some());
}

#[test]
fn monitor_stays_idle_for_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let (mut monitor, events) = FileMonitor::new(engine(dir.path()), MonitorOptions::default());
    assert!(monitor.start_monitoring(dir.path().join("missing")).is_err());
    assert!(!monitor.is_running());
    assert!(matches!(events.try_recv(), Ok(MonitorEvent::Error(_))));
}
