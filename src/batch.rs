//! Batch removal over a list of files.
//!
//! Files are processed one at a time, in order, on a single worker. Progress,
//! status lines and the final report are sent to the caller as
//! [`BatchEvent`]s. When an output file already exists the worker asks the
//! caller for permission through [`BatchEvent::OverwriteRequested`] and blocks
//! until [`BatchHandle::set_overwrite_allowed`] is called.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::encode::{self, OutputFormat};
use crate::engine::{self, WatermarkEngine, DEFAULT_QUALITY};
use crate::error::{Error, Result};

/// Marker inserted into batch output names.
pub const OUTPUT_MARKER: &str = "_no_watermark";

/// Options for one batch run.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Directory receiving cleaned files. Created if missing.
    pub output_dir: PathBuf,
    /// Output encoder, or [`OutputFormat::Keep`] to follow each input.
    pub format: OutputFormat,
    /// Encoding quality, 1-100.
    pub quality: u8,
}

impl BatchOptions {
    /// Options writing to `output_dir`, keeping formats, at [`DEFAULT_QUALITY`].
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            format: OutputFormat::Keep,
            quality: DEFAULT_QUALITY,
        }
    }
}

/// Outcome for a single input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// The watermark was removed and the result written.
    Success {
        /// Input file.
        input: PathBuf,
        /// Written output file.
        output: PathBuf,
        /// Size of the output in bytes.
        file_size: u64,
    },
    /// The file could not be processed.
    Failure {
        /// Input file.
        input: PathBuf,
        /// Human-readable cause.
        reason: String,
    },
}

impl ProcessingResult {
    /// The input this result belongs to.
    #[must_use]
    pub fn input(&self) -> &Path {
        match self {
            Self::Success { input, .. } | Self::Failure { input, .. } => input,
        }
    }

    /// Whether this is a [`ProcessingResult::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Everything a finished batch produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// One entry per processed (not skipped) input, in input order.
    pub results: Vec<ProcessingResult>,
    /// Summary of all failures, present if at least one file failed.
    pub failure_summary: Option<String>,
}

impl BatchReport {
    /// Successful results.
    pub fn successes(&self) -> impl Iterator<Item = &ProcessingResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    /// Failed results.
    pub fn failures(&self) -> impl Iterator<Item = &ProcessingResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

/// Messages from the batch worker to its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    /// Percentage of files handled so far, 0-100.
    Progress(u8),
    /// Human-readable status line.
    Status(String),
    /// The output path exists; answer with `set_overwrite_allowed`.
    OverwriteRequested(PathBuf),
    /// The run completed.
    Finished(BatchReport),
    /// The run stopped early because of an unrecoverable error.
    Error(String),
}

#[derive(Debug, Default)]
struct GateState {
    waiting: bool,
    answer: Option<bool>,
}

/// Blocking request/response channel for overwrite confirmation.
#[derive(Debug, Default)]
pub struct OverwriteGate {
    state: Mutex<GateState>,
    answered: Condvar,
}

impl OverwriteGate {
    /// A gate with no pending request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the pending overwrite request. Ignored if nothing is pending.
    pub fn set_overwrite_allowed(&self, allowed: bool) {
        let mut state = self.state.lock();
        if !state.waiting {
            warn!(allowed, "overwrite answer without a pending request");
            return;
        }
        state.answer = Some(allowed);
        self.answered.notify_all();
    }

    /// Whether the worker is currently blocked on an answer.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.state.lock().waiting
    }

    /// Open a request, run `announce` to tell the caller, then block for the
    /// answer. If `announce` reports that nobody is listening the request is
    /// denied immediately.
    fn request(&self, announce: impl FnOnce() -> bool) -> bool {
        let mut state = self.state.lock();
        state.answer = None;
        state.waiting = true;
        if !announce() {
            state.waiting = false;
            return false;
        }
        let allowed = loop {
            if let Some(answer) = state.answer.take() {
                break answer;
            }
            self.answered.wait(&mut state);
        };
        state.waiting = false;
        allowed
    }
}

/// Drives the engine over a list of files.
#[derive(Debug)]
pub struct BatchProcessor {
    engine: Arc<WatermarkEngine>,
    gate: Arc<OverwriteGate>,
}

impl BatchProcessor {
    /// Processor sharing `engine`.
    #[must_use]
    pub fn new(engine: Arc<WatermarkEngine>) -> Self {
        Self {
            engine,
            gate: Arc::new(OverwriteGate::new()),
        }
    }

    /// The gate overwrite requests block on.
    #[must_use]
    pub fn overwrite_gate(&self) -> Arc<OverwriteGate> {
        Arc::clone(&self.gate)
    }

    /// Run a batch on a background thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the worker thread cannot be spawned.
    pub fn spawn(
        engine: Arc<WatermarkEngine>,
        files: Vec<PathBuf>,
        options: BatchOptions,
    ) -> Result<BatchHandle> {
        let (tx, rx) = mpsc::channel();
        let processor = Self::new(engine);
        let gate = processor.overwrite_gate();
        let worker = thread::Builder::new()
            .name("watermark-batch".into())
            .spawn(move || {
                // Failures are already reported as events.
                let _ = processor.run(&files, &options, &tx);
            })?;
        Ok(BatchHandle {
            events: rx,
            gate,
            worker,
        })
    }

    /// Process `files` in order on the current thread.
    ///
    /// Someone else must answer overwrite requests through
    /// [`BatchProcessor::overwrite_gate`], otherwise a request blocks forever.
    /// The report is both sent as [`BatchEvent::Finished`] and returned.
    ///
    /// # Errors
    ///
    /// Stops before the first file, with the error also sent as
    /// [`BatchEvent::Error`], if the output directory cannot be created. Every
    /// other problem, missing watermark assets included, is recorded as a
    /// [`ProcessingResult::Failure`] for the file at hand and the run goes on.
    pub fn run(
        &self,
        files: &[PathBuf],
        options: &BatchOptions,
        events: &Sender<BatchEvent>,
    ) -> Result<BatchReport> {
        let emit = |event: BatchEvent| {
            // A caller that dropped the receiver no longer cares.
            let _ = events.send(event);
        };

        if let Err(e) = std::fs::create_dir_all(&options.output_dir) {
            error!(dir = %options.output_dir.display(), "cannot create output directory: {e}");
            emit(BatchEvent::Error(format!(
                "Failed to create output directory {}: {e}",
                options.output_dir.display()
            )));
            return Err(e.into());
        }

        let total = files.len();
        let mut results = Vec::with_capacity(total);
        let mut produced = HashSet::new();

        for (i, input) in files.iter().enumerate() {
            let name = display_name(input);
            emit(BatchEvent::Status(format!("Processing {}/{total}: {name}", i + 1)));

            match self.process_file(input, options, &mut produced, events) {
                Some(result) => {
                    if let ProcessingResult::Failure { reason, .. } = &result {
                        warn!(file = %input.display(), "{reason}");
                    }
                    results.push(result);
                }
                None => {
                    info!(file = %input.display(), "skipped, overwrite denied");
                    emit(BatchEvent::Status(format!("Skipped {name}: output exists")));
                }
            }

            emit(BatchEvent::Progress(progress(i + 1, total)));
        }

        let report = BatchReport {
            failure_summary: failure_summary(&results),
            results,
        };
        info!(
            succeeded = report.successes().count(),
            failed = report.failures().count(),
            "batch finished"
        );
        emit(BatchEvent::Finished(report.clone()));
        Ok(report)
    }

    /// `None` means skipped after a denied overwrite.
    fn process_file(
        &self,
        input: &Path,
        options: &BatchOptions,
        produced: &mut HashSet<PathBuf>,
        events: &Sender<BatchEvent>,
    ) -> Option<ProcessingResult> {
        let failure = |e: &Error| ProcessingResult::Failure {
            input: input.to_path_buf(),
            reason: e.to_string(),
        };

        if let Err(e) = engine::check_input_file(input) {
            return Some(failure(&e));
        }

        let output = output_path(input, options, &timestamp(), produced);
        if output.exists() {
            let allowed = self
                .gate
                .request(|| events.send(BatchEvent::OverwriteRequested(output.clone())).is_ok());
            if !allowed {
                return None;
            }
        }

        match self.clean(input, &output, options) {
            Ok(file_size) => {
                let _ = events.send(BatchEvent::Status(format!("Saved {}", display_name(&output))));
                produced.insert(output.clone());
                Some(ProcessingResult::Success {
                    input: input.to_path_buf(),
                    output,
                    file_size,
                })
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(file = %input.display(), "watermark assets unusable: {e}");
                }
                Some(failure(&e))
            }
        }
    }

    fn clean(&self, input: &Path, output: &Path, options: &BatchOptions) -> Result<u64> {
        let cleaned = self.engine.remove_from_image(engine::open_image(input)?)?;
        encode::save_image(&cleaned, output, options.format, options.quality)?;
        Ok(std::fs::metadata(output)?.len())
    }
}

/// Caller side of a batch started with [`BatchProcessor::spawn`].
#[derive(Debug)]
pub struct BatchHandle {
    events: Receiver<BatchEvent>,
    gate: Arc<OverwriteGate>,
    worker: JoinHandle<()>,
}

impl BatchHandle {
    /// Events from the worker. The channel closes when the run is over.
    #[must_use]
    pub const fn events(&self) -> &Receiver<BatchEvent> {
        &self.events
    }

    /// Answer a pending [`BatchEvent::OverwriteRequested`].
    pub fn set_overwrite_allowed(&self, allowed: bool) {
        self.gate.set_overwrite_allowed(allowed);
    }

    /// Wait for the worker to exit.
    ///
    /// # Errors
    ///
    /// Returns the panic payload if the worker panicked.
    pub fn join(self) -> thread::Result<()> {
        drop(self.events);
        self.worker.join()
    }
}

/// `<output_dir>/<stem>_no_watermark_<timestamp>.<ext>`, with a `_<n>` suffix
/// if an earlier file of this run already took the name.
fn output_path(
    input: &Path,
    options: &BatchOptions,
    timestamp: &str,
    produced: &HashSet<PathBuf>,
) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    let ext = options
        .format
        .extension()
        .map(str::to_owned)
        .or_else(|| input.extension().map(|e| e.to_string_lossy().into_owned()));
    let file_name = |base: &str| match &ext {
        Some(ext) => format!("{base}.{ext}"),
        None => base.to_owned(),
    };

    let base = format!("{stem}{OUTPUT_MARKER}_{timestamp}");
    let mut candidate = options.output_dir.join(file_name(&base));
    let mut n = 2;
    while produced.contains(&candidate) {
        candidate = options.output_dir.join(file_name(&format!("{base}_{n}")));
        n += 1;
    }
    candidate
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}

#[allow(clippy::cast_possible_truncation)]
fn progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (done * 100 / total).min(100) as u8
}

fn failure_summary(results: &[ProcessingResult]) -> Option<String> {
    let lines: Vec<String> = results
        .iter()
        .filter_map(|r| match r {
            ProcessingResult::Failure { input, reason } => {
                Some(format!("- {}: {reason}", display_name(input)))
            }
            ProcessingResult::Success { .. } => None,
        })
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(format!("{} file(s) failed:\n{}", lines.len(), lines.join("\n")))
}

fn display_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |f| f.to_string_lossy().into_owned(),
    )
}
