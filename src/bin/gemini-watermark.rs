use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use gemini_watermark_remover::{
    watch, BatchEvent, BatchOptions, BatchProcessor, BatchReport, FileMonitor, MonitorEvent,
    MonitorOptions, OutputFormat, ProcessingResult, WatermarkEngine,
};

#[derive(Parser)]
#[command(
    name = "gemini-watermark",
    about = "Remove visible Gemini AI watermarks via reverse alpha blending",
    version,
    after_help = "NOTE: This tool only removes the VISIBLE Gemini watermark (star/sparkle logo).\n\
                  It cannot remove SynthID (invisible watermark)."
)]
struct Cli {
    /// Directory holding bg_48.png and bg_96.png
    #[arg(long, env = "GEMINI_WATERMARK_ASSETS", global = true)]
    assets: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Remove the watermark from one or more image files
    Clean {
        /// Input image files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Output format: keep, jpeg, png or webp
        #[arg(short, long, default_value = "keep")]
        format: OutputFormat,

        /// Encoding quality (1-100)
        #[arg(long, default_value_t = 95, value_parser = clap::value_parser!(u8).range(1..=100))]
        quality: u8,

        /// Overwrite existing outputs without asking
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Watch a folder and clean new Gemini images as they appear
    Watch {
        /// Folder to watch
        dir: PathBuf,

        /// Wait this long after a file appears before processing it
        #[arg(long, default_value_t = 2000)]
        debounce_ms: u64,
    },

    /// Show where the watermark sits for an image size
    Info {
        /// Image width in pixels
        width: u32,
        /// Image height in pixels
        height: u32,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Command::Info { width, height } => print_info(width, height),
        Command::Clean {
            files,
            output_dir,
            format,
            quality,
            yes,
        } => {
            let engine = load_engine(cli.assets);
            let options = BatchOptions {
                output_dir,
                format,
                quality,
            };
            if !run_clean(engine, files, options, yes, cli.quiet) {
                process::exit(1);
            }
        }
        Command::Watch { dir, debounce_ms } => {
            let engine = load_engine(cli.assets);
            let options = MonitorOptions {
                debounce: Duration::from_millis(debounce_ms),
                ..MonitorOptions::default()
            };
            if !run_watch(engine, &dir, options) {
                process::exit(1);
            }
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let default = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_engine(assets: Option<PathBuf>) -> Arc<WatermarkEngine> {
    let engine = assets.map_or_else(WatermarkEngine::with_default_assets, WatermarkEngine::new);
    if let Err(e) = engine.alpha_maps().warm_up() {
        eprintln!("Fatal: Failed to initialize engine: {e}");
        process::exit(1);
    }
    Arc::new(engine)
}

fn print_info(width: u32, height: u32) {
    let info = gemini_watermark_remover::geometry::watermark_info(width, height);
    println!("image:    {width}x{height}");
    println!(
        "logo:     {0}x{0} (margins right={1}, bottom={2})",
        info.config.logo_size, info.config.margin_right, info.config.margin_bottom
    );
    println!(
        "position: x={}, y={}, {}x{}",
        info.rect.x, info.rect.y, info.rect.width, info.rect.height
    );
}

/// Returns `false` if anything failed.
fn run_clean(
    engine: Arc<WatermarkEngine>,
    files: Vec<PathBuf>,
    options: BatchOptions,
    yes: bool,
    quiet: bool,
) -> bool {
    let handle = match BatchProcessor::spawn(engine, files, options) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Error: {e}");
            return false;
        }
    };

    let mut ok = true;
    for event in handle.events() {
        match event {
            BatchEvent::Progress(percent) => debug!(percent, "progress"),
            BatchEvent::Status(line) => info!("{line}"),
            BatchEvent::OverwriteRequested(path) => {
                let allowed = yes || confirm_overwrite(&path);
                handle.set_overwrite_allowed(allowed);
            }
            BatchEvent::Finished(report) => {
                print_report(&report, quiet);
                ok &= report.failure_summary.is_none();
            }
            BatchEvent::Error(message) => {
                eprintln!("Fatal: {message}");
                ok = false;
            }
        }
    }

    if handle.join().is_err() {
        eprintln!("Fatal: batch worker panicked");
        ok = false;
    }
    ok
}

fn confirm_overwrite(path: &Path) -> bool {
    eprint!("{} already exists. Overwrite? [y/N] ", path.display());
    let _ = io::stderr().flush();
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn print_report(report: &BatchReport, quiet: bool) {
    for result in &report.results {
        let filename = result.input().file_name().map_or_else(
            || result.input().display().to_string(),
            |f| f.to_string_lossy().to_string(),
        );
        match result {
            ProcessingResult::Success {
                output, file_size, ..
            } => {
                if !quiet {
                    eprintln!("[OK] {filename} -> {} ({file_size} bytes)", output.display());
                }
            }
            ProcessingResult::Failure { reason, .. } => eprintln!("[FAIL] {filename}: {reason}"),
        }
    }

    if let Some(summary) = &report.failure_summary {
        eprintln!();
        eprintln!("{summary}");
    } else if report.results.len() > 1 && !quiet {
        eprintln!();
        eprintln!("[Summary] Processed: {}", report.results.len());
    }
}

/// Returns `false` if monitoring could not start.
fn run_watch(engine: Arc<WatermarkEngine>, dir: &Path, options: MonitorOptions) -> bool {
    let (mut monitor, events) = FileMonitor::new(engine, options);

    let printer = std::thread::spawn(move || {
        for event in events {
            match event {
                MonitorEvent::Status(line) => info!("{line}"),
                MonitorEvent::FileProcessed { original, output } => eprintln!(
                    "[OK] {} -> {}",
                    original.display(),
                    output.display()
                ),
                MonitorEvent::Error(message) => eprintln!("[FAIL] {message}"),
                MonitorEvent::MonitoringStarted(path) => eprintln!(
                    "Watching {} for {}* files (archive: {})",
                    path.display(),
                    watch::FILE_PREFIX,
                    watch::ARCHIVE_FOLDER_NAME
                ),
                MonitorEvent::MonitoringStopped => eprintln!("Stopped."),
            }
        }
    });

    let started = monitor.start_monitoring(dir).is_ok();
    if started {
        eprintln!("Press Enter to stop.");
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            // No terminal attached: keep watching until the process is killed.
            Ok(0) => loop {
                std::thread::park();
            },
            Ok(_) => {}
            Err(e) => warn!("cannot read stdin: {e}"),
        }
        monitor.stop_monitoring();
    }

    drop(monitor);
    let _ = printer.join();
    started
}
