//! Folder monitor: clean new Gemini images as they appear.
//!
//! [`FileMonitor`] subscribes to create and rename events of one directory
//! (non-recursive). Files named `Gemini_Generated_Image*` with an image
//! extension are processed after a short debounce delay: the watermark is
//! removed into `Clean_<name>_<timestamp>.png` next to the original, and the
//! original is moved into the archive subdirectory.
//!
//! Processing of debounced files runs on its own thread per file, so several
//! files may be in flight at once. Each path is processed at most once per
//! monitoring session.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::batch::OUTPUT_MARKER;
use crate::encode::{self, OutputFormat};
use crate::engine::{self, WatermarkEngine};
use crate::error::{Error, Result};

/// Subdirectory of the watched folder receiving processed originals.
pub const ARCHIVE_FOLDER_NAME: &str = "Gemini Watermark Remover Archive";

/// Name prefix of images saved by Gemini.
pub const FILE_PREFIX: &str = "Gemini_Generated_Image";

/// Name prefix of files written by the monitor.
pub const CLEAN_PREFIX: &str = "Clean_";

/// Extensions the monitor reacts to (lowercase, no dot).
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "gif"];

/// Timing knobs for the monitor.
#[derive(Debug, Clone, Copy)]
pub struct MonitorOptions {
    /// Wait between seeing a file and processing it, so the producer can
    /// finish writing.
    pub debounce: Duration,
    /// How often the watch loop wakes up to check for due files and stop
    /// requests.
    pub poll_interval: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Messages from the monitor to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Human-readable status line.
    Status(String),
    /// A file was cleaned and archived.
    FileProcessed {
        /// Where the original was found (it now lives in the archive).
        original: PathBuf,
        /// The cleaned PNG.
        output: PathBuf,
    },
    /// Something went wrong; the monitor keeps running unless it never started.
    Error(String),
    /// Watching began.
    MonitoringStarted(PathBuf),
    /// Watching ended.
    MonitoringStopped,
}

/// Whether `path` looks like a Gemini image: known extension and the
/// `Gemini_Generated_Image` prefix.
#[must_use]
pub fn is_candidate(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let ext_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
    ext_ok && name.starts_with(FILE_PREFIX)
}

/// Whether `path` was written by this crate (batch or monitor output).
#[must_use]
pub fn is_pipeline_output(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy())
        .is_some_and(|name| name.contains(OUTPUT_MARKER) || name.starts_with(CLEAN_PREFIX))
}

/// [`is_candidate`] and not [`is_pipeline_output`].
#[must_use]
pub fn should_process(path: &Path) -> bool {
    is_candidate(path) && !is_pipeline_output(path)
}

/// File stem with the Gemini prefix and following underscores removed.
///
/// `Gemini_Generated_Image_42` becomes `42`. An empty remainder becomes `image`.
#[must_use]
pub fn stripped_name(stem: &str) -> &str {
    let rest = stem.strip_prefix(FILE_PREFIX).unwrap_or(stem).trim_start_matches('_');
    if rest.is_empty() {
        "image"
    } else {
        rest
    }
}

/// Stem of the cleaned file: `Clean_<strippedName>_<timestamp>`.
#[must_use]
pub fn clean_file_stem(original: &Path, timestamp: &str) -> String {
    let stem = original.file_stem().unwrap_or_default().to_string_lossy();
    format!("{CLEAN_PREFIX}{}_{timestamp}", stripped_name(&stem))
}

/// Paths seen by the monitor, guarded for concurrent callbacks. Never shrinks.
#[derive(Debug, Default)]
pub struct ProcessedSet {
    paths: Mutex<HashSet<PathBuf>>,
}

impl ProcessedSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `path`. Returns `false` if it was already recorded.
    pub fn try_mark_processed(&self, path: PathBuf) -> bool {
        self.paths.lock().insert(path)
    }

    /// Whether `path` was recorded.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.lock().contains(path)
    }

    /// Number of recorded paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.lock().len()
    }

    /// Whether nothing was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pending paths keyed by path; rescheduling a path moves its deadline.
#[derive(Debug, Default)]
struct DebounceQueue {
    pending: HashMap<PathBuf, Instant>,
}

impl DebounceQueue {
    fn schedule(&mut self, path: PathBuf, due: Instant) {
        self.pending.insert(path, due);
    }

    fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &due {
            self.pending.remove(path);
        }
        due
    }
}

/// Paths an event introduces into the directory.
fn arrived_paths(event: &Event) -> Vec<&Path> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().map(PathBuf::as_path).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.get(1).map(PathBuf::as_path).into_iter().collect()
        }
        // Backends that cannot tell the two sides apart; keep what exists.
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            event.paths.iter().map(PathBuf::as_path).filter(|p| p.exists()).collect()
        }
        _ => Vec::new(),
    }
}

/// State shared by the watch loop and the per-file threads of one session.
#[derive(Debug)]
struct Pipeline {
    engine: Arc<WatermarkEngine>,
    watch_dir: PathBuf,
    archive_dir: PathBuf,
    processed: ProcessedSet,
    events: Sender<MonitorEvent>,
}

impl Pipeline {
    fn new(engine: Arc<WatermarkEngine>, watch_dir: PathBuf, events: Sender<MonitorEvent>) -> Self {
        Self {
            engine,
            archive_dir: watch_dir.join(ARCHIVE_FOLDER_NAME),
            watch_dir,
            processed: ProcessedSet::new(),
            events,
        }
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }

    fn status(&self, message: String) {
        self.emit(MonitorEvent::Status(message));
    }

    /// Filter a raw event path and queue it.
    fn observe(&self, path: &Path, queue: &mut DebounceQueue, debounce: Duration) {
        debug!(path = %path.display(), "file event");
        if path.is_dir() || !should_process(path) {
            return;
        }
        let name = file_name(path);
        info!(file = %name, "matched Gemini image");
        self.status(format!("Matched Gemini image: {name}"));
        queue.schedule(path.to_path_buf(), Instant::now() + debounce);
    }

    /// Debounced handling of one file. Never fails; problems become events.
    fn handle(&self, path: &Path) {
        match engine::check_input_file(path) {
            Ok(_) => {}
            Err(e @ (Error::MissingFile(_) | Error::EmptyFile(_))) => {
                warn!(file = %path.display(), "skipping: {e}");
                return;
            }
            Err(e) => {
                self.fail(path, &e);
                return;
            }
        }

        if is_pipeline_output(path) {
            debug!(file = %path.display(), "skipping own output");
            return;
        }
        // A marked path is never retried; check the assets first.
        if let Err(e) = self.engine.alpha_maps().warm_up() {
            self.fail(path, &e);
            return;
        }

        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if !self.processed.try_mark_processed(key) {
            debug!(file = %path.display(), "already processed");
            return;
        }

        match self.process(path) {
            Ok(output) => {
                info!(original = %path.display(), output = %output.display(), "file processed");
                self.emit(MonitorEvent::FileProcessed {
                    original: path.to_path_buf(),
                    output,
                });
            }
            Err(e) => self.fail(path, &e),
        }
    }

    fn process(&self, path: &Path) -> Result<PathBuf> {
        let name = file_name(path);
        self.status(format!("Found new file: {name}"));

        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
        let output = reserve_unique_path(&self.watch_dir, &clean_file_stem(path, &timestamp), "png")?;

        self.status(format!("Processing: {name}"));
        let written = engine::open_image(path)
            .and_then(|img| self.engine.remove_from_image(img))
            .and_then(|cleaned| encode::save_image(&cleaned, &output, OutputFormat::Png, 100));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&output);
            return Err(e);
        }
        self.status(format!("Watermark removed: {}", file_name(&output)));

        let archived = self.archive(path)?;
        self.status(format!("Original archived: {}", file_name(&archived)));
        Ok(output)
    }

    /// Move `path` into the archive folder, numbering on collision.
    fn archive(&self, path: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.archive_dir)?;
        let stem = path.file_stem().unwrap_or_default().to_string_lossy();
        let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

        let mut target = self.archive_dir.join(path.file_name().unwrap_or_default());
        let mut n = 1;
        while target.exists() {
            let name = match &ext {
                Some(ext) => format!("{stem}_{n}.{ext}"),
                None => format!("{stem}_{n}"),
            };
            target = self.archive_dir.join(name);
            n += 1;
        }

        if std::fs::rename(path, &target).is_err() {
            std::fs::copy(path, &target)?;
            std::fs::remove_file(path)?;
        }
        Ok(target)
    }

    fn fail(&self, path: &Path, err: &Error) {
        error!(file = %path.display(), "processing failed: {err}");
        self.emit(MonitorEvent::Error(format!(
            "Failed to process {}: {err}",
            file_name(path)
        )));
    }
}

/// Create `<dir>/<stem>.<ext>`, or `<stem>_<n>.<ext>` if taken, and return it.
/// The empty file reserves the name against concurrent writers.
fn reserve_unique_path(dir: &Path, stem: &str, ext: &str) -> Result<PathBuf> {
    let mut candidate = dir.join(format!("{stem}.{ext}"));
    let mut n = 1;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                candidate = dir.join(format!("{stem}_{n}.{ext}"));
                n += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |n| n.to_string_lossy().into_owned(),
    )
}

/// Runs until `running` is cleared. Owns the OS watcher, which is released
/// when the loop returns.
fn watch_loop(
    watcher: RecommendedWatcher,
    fs_events: &Receiver<notify::Result<Event>>,
    pipeline: &Arc<Pipeline>,
    options: MonitorOptions,
    running: &AtomicBool,
) {
    let mut queue = DebounceQueue::default();
    let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

    while running.load(Ordering::SeqCst) {
        match fs_events.recv_timeout(options.poll_interval) {
            Ok(Ok(event)) => {
                for path in arrived_paths(&event) {
                    pipeline.observe(path, &mut queue, options.debounce);
                }
            }
            Ok(Err(e)) => {
                warn!("watch error: {e}");
                pipeline.emit(MonitorEvent::Error(format!("Watch error: {e}")));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                error!("file watcher disconnected");
                pipeline.emit(MonitorEvent::Error("File watcher disconnected".into()));
                break;
            }
        }

        for path in queue.take_due(Instant::now()) {
            let worker = Arc::clone(pipeline);
            let spawned = thread::Builder::new()
                .name("watermark-file".into())
                .spawn(move || worker.handle(&path));
            match spawned {
                Ok(handle) => in_flight.push(handle),
                Err(e) => pipeline.emit(MonitorEvent::Error(format!("Failed to start worker: {e}"))),
            }
        }
        in_flight.retain(|handle| !handle.is_finished());
    }

    drop(watcher);
    if !queue.pending.is_empty() {
        debug!(pending = queue.pending.len(), "dropping pending files");
    }
    for handle in in_flight {
        if handle.join().is_err() {
            error!("file worker panicked");
        }
    }
}

#[derive(Debug)]
struct Session {
    watch_dir: PathBuf,
    running: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

/// Watches one directory at a time and cleans new Gemini images.
#[derive(Debug)]
pub struct FileMonitor {
    engine: Arc<WatermarkEngine>,
    options: MonitorOptions,
    events: Sender<MonitorEvent>,
    session: Option<Session>,
}

impl FileMonitor {
    /// An idle monitor and the receiver for its events.
    #[must_use]
    pub fn new(engine: Arc<WatermarkEngine>, options: MonitorOptions) -> (Self, Receiver<MonitorEvent>) {
        let (tx, rx) = mpsc::channel();
        let monitor = Self {
            engine,
            options,
            events: tx,
            session: None,
        };
        (monitor, rx)
    }

    /// Start watching `watch_dir`, stopping any previous session first.
    ///
    /// # Errors
    ///
    /// [`Error::WatchDirMissing`] if the directory does not exist,
    /// [`Error::WatchSubscription`] if the OS watcher cannot be set up, or
    /// [`Error::Io`] if the worker cannot be spawned. The error is also sent
    /// as [`MonitorEvent::Error`] and the monitor stays idle.
    pub fn start_monitoring(&mut self, watch_dir: impl AsRef<Path>) -> Result<()> {
        self.stop_monitoring();
        let watch_dir = watch_dir.as_ref().to_path_buf();

        if !watch_dir.is_dir() {
            return Err(self.report(Error::WatchDirMissing(watch_dir)));
        }

        let (tx, fs_events) = mpsc::channel();
        let mut watcher = match notify::recommended_watcher(tx) {
            Ok(watcher) => watcher,
            Err(e) => return Err(self.report(e.into())),
        };
        if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
            return Err(self.report(e.into()));
        }

        let running = Arc::new(AtomicBool::new(true));
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&self.engine),
            watch_dir.clone(),
            self.events.clone(),
        ));
        let options = self.options;
        let flag = Arc::clone(&running);
        let spawned = thread::Builder::new()
            .name("watermark-monitor".into())
            .spawn(move || watch_loop(watcher, &fs_events, &pipeline, options, &flag));
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => return Err(self.report(e.into())),
        };

        info!(dir = %watch_dir.display(), "monitoring started");
        let _ = self.events.send(MonitorEvent::MonitoringStarted(watch_dir.clone()));
        let _ = self
            .events
            .send(MonitorEvent::Status(format!("Monitoring {}", watch_dir.display())));
        self.session = Some(Session {
            watch_dir,
            running,
            worker,
        });
        Ok(())
    }

    /// Stop watching. Returns once the watch loop and all in-flight files are
    /// done. Does nothing when idle.
    pub fn stop_monitoring(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.running.store(false, Ordering::SeqCst);
        if session.worker.join().is_err() {
            error!("monitor worker panicked");
        }
        info!(dir = %session.watch_dir.display(), "monitoring stopped");
        let _ = self.events.send(MonitorEvent::MonitoringStopped);
        let _ = self.events.send(MonitorEvent::Status("Monitoring stopped".into()));
    }

    /// Whether a session is active.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// The directory being watched, if any.
    #[must_use]
    pub fn watch_dir(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.watch_dir.as_path())
    }

    fn report(&self, err: Error) -> Error {
        error!("cannot start monitoring: {err}");
        let _ = self.events.send(MonitorEvent::Error(err.to_string()));
        err
    }
}

impl Drop for FileMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}
