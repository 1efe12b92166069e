//! display-latency: command line front end
//!
//! Subcommands:
//! - `capture`: capture frames from the desktop and save them
//! - `estimate`: align two saved frame sequences offline
//! - `measure`: run a live measurement against a cooperating renderer

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use display_latency::{
    capture::{CaptureSession, FrameSource, MockFrameSource},
    clock::{Clock, PerformanceCounter},
    config,
    error::{LatencyError, LatencyResult},
    latency::{EstimatorConfig, LatencyEstimator},
    measure::MeasureOptions,
    model::{BackendType, CaptureRegion, LatencyReport, TimestampedFrame},
    util::image_store::{CAPTURE_IMAGE_SUFFIX, ImageStore, RENDER_IMAGE_SUFFIX},
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// Desktop size of `--backend mock`
const MOCK_WIDTH: u32 = 1280;
const MOCK_HEIGHT: u32 = 720;

#[derive(Parser)]
#[command(name = "display-latency")]
#[command(about = "Measure end-to-end display latency", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture frames and save them as timestamped PNG files
    Capture {
        /// Region as x,y,width,height in desktop coordinates (repeatable)
        #[arg(long = "region", required = true)]
        regions: Vec<CaptureRegion>,

        /// Number of frames to capture
        #[arg(long, default_value_t = 60)]
        frames: usize,

        /// Output directory
        #[arg(short, long)]
        out: PathBuf,

        /// Capture backend (dxgi, mock)
        #[arg(long, default_value = "dxgi")]
        backend: BackendType,
    },

    /// Estimate latency from saved rendered and captured frames
    Estimate {
        /// Directory holding `*.render.png` frames
        #[arg(long)]
        rendered: PathBuf,

        /// Directory holding `*.capture.png` frames
        #[arg(long)]
        captured: PathBuf,

        /// Tick rate of the stored timestamps (defaults to this machine's counter)
        #[arg(long)]
        ticks_per_second: Option<f64>,

        #[command(flatten)]
        matching: MatchingArgs,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Measure latency live against a renderer using signal files
    Measure {
        /// Region as x,y,width,height in desktop coordinates (repeatable)
        #[arg(long = "region", required = true)]
        regions: Vec<CaptureRegion>,

        /// Directory the renderer saves its frames to
        #[arg(long)]
        image_dir: PathBuf,

        /// Directory holding the signal marker files
        #[arg(long)]
        signal_dir: PathBuf,

        /// Seconds to wait for the renderer to save its frames
        #[arg(long)]
        timeout_secs: Option<u64>,

        #[command(flatten)]
        matching: MatchingArgs,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Also save the captured frames next to the rendered ones
        #[arg(long)]
        keep_captured: bool,
    },
}

#[derive(clap::Args)]
struct MatchingArgs {
    /// Captured frames compared against each rendered frame
    #[arg(long, default_value_t = config::MATCH_WINDOW)]
    window: usize,

    /// Minimum correlation score for a match
    #[arg(long, default_value_t = config::MATCH_THRESHOLD)]
    threshold: f64,
}

impl MatchingArgs {
    fn config(&self) -> EstimatorConfig {
        EstimatorConfig {
            window:    self.window,
            threshold: self.threshold,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON reports on stdout stay parseable
    let logger = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("display_latency=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false);
    if cli.log_json {
        logger.json().init();
    } else {
        logger.init();
    }

    let result = match cli.command {
        Commands::Capture {
            regions,
            frames,
            out,
            backend,
        } => capture(regions, frames, out, backend).await,
        Commands::Estimate {
            rendered,
            captured,
            ticks_per_second,
            matching,
            json,
        } => estimate(rendered, captured, ticks_per_second, matching.config(), json),
        Commands::Measure {
            regions,
            image_dir,
            signal_dir,
            timeout_secs,
            matching,
            json,
            keep_captured,
        } => {
            let mut options = MeasureOptions::new(regions)
                .with_estimator(matching.config())
                .with_save_captured(keep_captured);
            if let Some(secs) = timeout_secs {
                options = options.with_timeout(Duration::from_secs(secs));
            }
            measure(image_dir, signal_dir, options, json).await
        }
    };

    if let Err(e) = &result {
        if let Some(latency_error) = e.downcast_ref::<LatencyError>() {
            eprintln!("Hint: {}", latency_error.remediation_hint());
        }
    }
    result
}

async fn capture(
    regions: Vec<CaptureRegion>,
    frames: usize,
    out: PathBuf,
    backend: BackendType,
) -> Result<()> {
    println!("Capturing {frames} frames from {} region(s) ({backend})...", regions.len());

    let per_region = match backend {
        BackendType::Mock => {
            let source = MockFrameSource::animated(MOCK_WIDTH, MOCK_HEIGHT, frames);
            collect_frames(move || Ok(CaptureSession::new(source)), regions, frames).await?
        }
        BackendType::Dxgi => collect_dxgi(regions, frames).await?,
    };

    for (index, frames) in per_region.iter().enumerate() {
        let store = ImageStore::open(out.join(format!("region-{index}")))?;
        let written = store.save(frames, CAPTURE_IMAGE_SUFFIX)?;
        println!("✓ Region {index}: {written} frames saved to {}", store.path().display());
    }
    Ok(())
}

async fn collect_frames<S, F>(
    open_session: F,
    regions: Vec<CaptureRegion>,
    frames: usize,
) -> Result<Vec<Vec<TimestampedFrame>>>
where
    S: FrameSource + 'static,
    F: FnOnce() -> LatencyResult<CaptureSession<S>> + Send + 'static,
{
    let collected = tokio::task::spawn_blocking(move || {
        let mut session = open_session()?;
        session.collect(&regions, frames)
    })
    .await
    .context("capture task failed")??;
    Ok(collected)
}

#[cfg(all(target_os = "windows", feature = "dxgi-backend"))]
async fn collect_dxgi(
    regions: Vec<CaptureRegion>,
    frames: usize,
) -> Result<Vec<Vec<TimestampedFrame>>> {
    collect_frames(open_dxgi_session, regions, frames).await
}

#[cfg(not(all(target_os = "windows", feature = "dxgi-backend")))]
async fn collect_dxgi(
    _regions: Vec<CaptureRegion>,
    _frames: usize,
) -> Result<Vec<Vec<TimestampedFrame>>> {
    Err(LatencyError::BackendNotAvailable {
        backend: BackendType::Dxgi,
    }
    .into())
}

#[cfg(all(target_os = "windows", feature = "dxgi-backend"))]
fn open_dxgi_session() -> LatencyResult<CaptureSession<display_latency::capture::DxgiFrameSource>> {
    use display_latency::capture::PipelineConfig;

    Ok(CaptureSession::open_primary()?
        .with_config(PipelineConfig::default().with_acquire_timeout(config::acquire_timeout())))
}

fn estimate(
    rendered: PathBuf,
    captured: PathBuf,
    ticks_per_second: Option<f64>,
    matching: EstimatorConfig,
    json: bool,
) -> Result<()> {
    let rendered = ImageStore::open(&rendered)?.load(RENDER_IMAGE_SUFFIX)?;
    let captured = ImageStore::open(&captured)?.load(CAPTURE_IMAGE_SUFFIX)?;
    let ticks_per_second =
        ticks_per_second.unwrap_or_else(|| PerformanceCounter.ticks_per_second() as f64);
    info!(
        rendered = rendered.len(),
        captured = captured.len(),
        ticks_per_second,
        "Loaded frames"
    );

    let estimate = LatencyEstimator::new(ticks_per_second)?
        .with_config(matching)?
        .estimate(&rendered, &captured);
    let report = LatencyReport::new(estimate, rendered.len(), captured.len(), ticks_per_second);
    print_report(&report, json)
}

#[cfg(all(target_os = "windows", feature = "dxgi-backend"))]
async fn measure(
    image_dir: PathBuf,
    signal_dir: PathBuf,
    options: MeasureOptions,
    json: bool,
) -> Result<()> {
    use display_latency::{measure::run_measurement, signal::RenderSignals};

    let store = ImageStore::open(&image_dir)?;
    let signals = RenderSignals::file_backed(&signal_dir)?;
    println!("Waiting for the renderer (signals in {})...", signal_dir.display());

    let outcome = run_measurement(open_dxgi_session, signals, &store, options).await?;
    print_report(&outcome.report(), json)
}

#[cfg(not(all(target_os = "windows", feature = "dxgi-backend")))]
async fn measure(
    _image_dir: PathBuf,
    _signal_dir: PathBuf,
    _options: MeasureOptions,
    _json: bool,
) -> Result<()> {
    Err(LatencyError::BackendNotAvailable {
        backend: BackendType::Dxgi,
    }
    .into())
}

fn print_report(report: &LatencyReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        for line in summary_lines(report) {
            println!("{line}");
        }
    }
    Ok(())
}

/// Human-readable report; zero matches still succeed with a 0 ms latency
fn summary_lines(report: &LatencyReport) -> Vec<String> {
    let mut lines = Vec::with_capacity(2);
    if report.match_count == 0 {
        warn!(
            rendered = report.rendered_frames,
            captured = report.captured_frames,
            "No rendered frame matched a captured frame"
        );
        lines.push(format!(
            "⚠ Matched 0 of {} rendered frames ({} captured)",
            report.rendered_frames, report.captured_frames
        ));
    } else {
        lines.push(format!(
            "✓ Matched {} of {} rendered frames",
            report.match_count, report.rendered_frames
        ));
    }
    lines.push(format!("Succeeded. Latency: {:.4}ms", report.latency_ms));
    lines
}
