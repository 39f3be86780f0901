//! Shutter: stream camera frames to a ring file, reporting loss and overrun

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use shutter::capture::{self, Device};
use shutter::pipeline::{LossMonitor, Pipeline, RunState};
use shutter::status::StatusLine;
use shutter::storage::{RingFileReader, RingWriter};
use shutter::{Config, OverrunPolicy, SourceKind};

const STATUS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file (default: ./shutter.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    source: Option<SourceKind>,

    /// Capture device path, V4L2 only
    #[arg(long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Capture frames into the ring file (default)
    Run {
        #[arg(short, long, env = "SHUTTER_OUTPUT")]
        output: Option<PathBuf>,

        #[arg(long)]
        max_images: Option<u32>,

        /// Frame pool capacity (power of two)
        #[arg(long)]
        pool: Option<usize>,

        /// Wait for free slots instead of aborting on overrun
        #[arg(long)]
        block: bool,
    },
    /// Count received and lost frames without writing anything
    Monitor,
    /// List the frames in a ring file
    Inspect {
        path: PathBuf,

        #[arg(long)]
        frame_size: usize,

        /// Total frames written, to list oldest first
        #[arg(long, requires = "max_images")]
        written: Option<u64>,

        #[arg(long)]
        max_images: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shutter=info"));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_timer(tracing_subscriber::fmt::time::uptime()),
    );
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(source) = cli.source {
        config.capture.source = source;
    }
    if let Some(device) = cli.device {
        config.capture.device_path = device;
    }

    let code = match cli.command.unwrap_or(Command::Run {
        output: None,
        max_images: None,
        pool: None,
        block: false,
    }) {
        Command::Run {
            output,
            max_images,
            pool,
            block,
        } => {
            if let Some(output) = output {
                config.storage.path = output;
            }
            if let Some(max_images) = max_images {
                config.storage.max_images = max_images;
            }
            if let Some(pool) = pool {
                config.pipeline.pool_capacity = pool;
            }
            if block {
                config.pipeline.overrun_policy = OverrunPolicy::Block;
            }
            config.validate()?;
            run(config).await?
        }
        Command::Monitor => {
            config.validate()?;
            monitor(config).await?
        }
        Command::Inspect {
            path,
            frame_size,
            written,
            max_images,
        } => inspect(path, frame_size, written, max_images)?,
    };

    // Exits without waiting on the blocking stdin reader
    std::process::exit(code);
}

/// Resolves on Enter; pends forever once stdin is closed
async fn keypress(lines: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>, open: &mut bool) {
    if *open {
        match lines.next_line().await {
            Ok(Some(_)) => return,
            Ok(None) | Err(_) => *open = false,
        }
    }
    std::future::pending::<()>().await
}

async fn run(config: Config) -> Result<i32> {
    let device = capture::open_device(&config.capture)?;
    let store = RingWriter::create(&config.storage.path)?;
    let path = config.storage.path.clone();

    let started = tokio::task::spawn_blocking(move || Pipeline::start(&config, device, store)).await?;
    let pipeline = match started {
        Ok(pipeline) => pipeline,
        Err(err) => {
            error!("Could not start capturing: {}", err);
            return Ok(err.exit_code());
        }
    };

    println!("   Capturing image data, writing it to {}", path.display());
    println!("        -- Press Enter or Ctrl-C to stop --");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    let mut status = StatusLine::new();
    let mut stdout = io::stdout();

    while pipeline.state() == RunState::Running {
        tokio::select! {
            _ = &mut ctrl_c => { pipeline.stop(); }
            _ = keypress(&mut lines, &mut stdin_open) => { pipeline.stop(); }
            _ = ticker.tick() => {
                let stats = pipeline.snapshot();
                status.update(&mut stdout, pipeline.context().elapsed(), stats.frames_received, stats.frames_lost)?;
            }
        }
    }
    status.finish(&mut stdout)?;

    let report = tokio::task::spawn_blocking(move || pipeline.shutdown()).await?;
    match &report.error {
        Some(err) => error!("Run ended: {}", err),
        None => info!("Run ended: {}", report.final_state),
    }
    println!(
        "   {:.2}s, {} frames received, {} written, {} lost, peak queue depth {}",
        report.elapsed.as_secs_f64(),
        report.stats.frames_received,
        report.stats.frames_written,
        report.stats.frames_lost,
        report.stats.peak_queue_depth
    );
    Ok(report.exit_code())
}

async fn monitor(config: Config) -> Result<i32> {
    let device: Arc<dyn Device> = capture::open_device(&config.capture)?;
    let monitor = LossMonitor::start(device, config.pipeline.slot_bytes)?;

    println!("   Looking for lost frames.  Press Enter or Ctrl-C to exit");
    let started = tokio::time::Instant::now();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    let mut status = StatusLine::new();
    let mut stdout = io::stdout();

    while monitor.is_running() {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = keypress(&mut lines, &mut stdin_open) => break,
            _ = ticker.tick() => {
                let counter = monitor.counter();
                status.update(&mut stdout, started.elapsed(), counter.received(), counter.lost())?;
            }
        }
    }
    status.finish(&mut stdout)?;

    let failed = !monitor.is_running();
    let (received, lost) = tokio::task::spawn_blocking(move || monitor.stop()).await?;
    println!("   {} frames received, {} lost", received, lost);
    Ok(if failed { 1 } else { 0 })
}

fn inspect(
    path: PathBuf,
    frame_size: usize,
    written: Option<u64>,
    max_images: Option<usize>,
) -> Result<i32> {
    let reader = RingFileReader::open(&path, frame_size)?;
    println!(
        "   {}: {} frames of {} bytes",
        path.display(),
        reader.frame_count(),
        reader.frame_size()
    );

    let frames = match (written, max_images) {
        (Some(written), Some(max_images)) => reader.frames_in_order(written, max_images),
        (None, _) => reader.frames().collect(),
        (Some(_), None) => return Err(eyre!("--written needs --max-images")),
    };

    let mut stdout = io::stdout().lock();
    for (i, frame) in frames.iter().enumerate() {
        let head: Vec<String> = frame.iter().take(8).map(|b| format!("{b:02x}")).collect();
        writeln!(stdout, "   {:5}  {}", i, head.join(" "))?;
    }
    Ok(0)
}
