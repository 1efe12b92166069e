//! Live latency measurement against a cooperating renderer
//!
//! The measurer and the renderer coordinate through [`RenderSignals`]:
//!
//! 1. the measurer opens a capture session and raises `start-render`,
//! 2. the renderer draws and timestamps its frames, raises `stop-render`,
//! 3. the renderer saves its frames to the shared [`ImageStore`] and raises
//!    `image-saved`,
//! 4. the measurer loads the rendered frames and aligns them against what
//!    it captured in the meantime.
//!
//! Capture and the signal watchers run on blocking tasks; the orchestration
//! itself is async.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    capture::{CaptureSession, FrameSource, PipelineStats},
    config,
    error::{LatencyError, LatencyResult},
    latency::{EstimatorConfig, LatencyEstimator},
    model::{CaptureRegion, LatencyEstimate, LatencyReport, TimestampedFrame},
    signal::{NamedSignal, RenderSignals},
    util::image_store::{CAPTURE_IMAGE_SUFFIX, ImageStore, RENDER_IMAGE_SUFFIX},
};

/// Parameters of one measurement
#[derive(Debug, Clone)]
pub struct MeasureOptions {
    /// Regions to capture; frames of the first region are matched
    pub regions:       Vec<CaptureRegion>,
    /// Deadline for the renderer to report its frames saved
    pub timeout:       Duration,
    /// Poll interval of the signal watchers
    pub poll_interval: Duration,
    pub estimator:     EstimatorConfig,
    /// Also write the captured frames to the image store
    pub save_captured: bool,
}

impl MeasureOptions {
    /// Options with timeouts taken from the environment
    pub fn new(regions: Vec<CaptureRegion>) -> Self {
        Self {
            regions,
            timeout: config::measure_timeout(),
            poll_interval: config::signal_poll_interval(),
            estimator: EstimatorConfig::default(),
            save_captured: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_estimator(mut self, estimator: EstimatorConfig) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_save_captured(mut self, save_captured: bool) -> Self {
        self.save_captured = save_captured;
        self
    }
}

/// Result of a completed measurement
#[derive(Debug)]
pub struct MeasurementOutcome {
    pub estimate:         LatencyEstimate,
    pub rendered:         Vec<TimestampedFrame>,
    pub captured:         Vec<TimestampedFrame>,
    pub stats:            PipelineStats,
    pub ticks_per_second: i64,
}

impl MeasurementOutcome {
    /// Summary without the frame data
    pub fn report(&self) -> LatencyReport {
        LatencyReport::new(
            self.estimate.clone(),
            self.rendered.len(),
            self.captured.len(),
            self.ticks_per_second as f64,
        )
    }
}

/// Flags shared between the orchestrator and its blocking tasks
#[derive(Debug, Default)]
struct Progress {
    render_stopped: AtomicBool,
    image_saved:    AtomicBool,
    /// Tells every task to wind down
    finished:       AtomicBool,
}

struct CaptureOutput {
    captured:         Vec<TimestampedFrame>,
    stats:            PipelineStats,
    ticks_per_second: i64,
}

/// Runs the measurer side of a measurement
///
/// `open_session` runs on a blocking task, so frame sources that must stay on
/// one thread are created where they are used. Captured frames are recorded
/// from the moment `start-render` is raised until `stop-render` is observed.
///
/// # Errors
///
/// - `InvalidParameter` if `options.regions` is empty
/// - any capture error, which takes precedence over signal errors
/// - `Timeout` if `image-saved` is not raised within `options.timeout`
/// - `WorkerPanicked` if a capture or watcher task panics
/// - I/O and image errors from loading or saving frames
pub async fn run_measurement<S, F>(
    open_session: F,
    signals: RenderSignals,
    store: &ImageStore,
    options: MeasureOptions,
) -> LatencyResult<MeasurementOutcome>
where
    S: FrameSource + 'static,
    F: FnOnce() -> LatencyResult<CaptureSession<S>> + Send + 'static,
{
    if options.regions.is_empty() {
        return Err(LatencyError::InvalidParameter {
            parameter: "regions".to_string(),
            reason:    "at least one capture region is required".to_string(),
        });
    }

    signals.reset()?;
    let progress = Arc::new(Progress::default());

    info!(
        regions = options.regions.len(),
        timeout_ms = options.timeout.as_millis() as u64,
        store = %store.path().display(),
        "Starting latency measurement"
    );

    let capture = spawn_capture(
        open_session,
        options.regions.clone(),
        Arc::clone(&signals.start_render),
        Arc::clone(&progress),
    );
    let stop_watcher = spawn_watcher(
        Arc::clone(&signals.stop_render),
        Arc::clone(&progress),
        |progress| &progress.render_stopped,
        options.poll_interval,
    );
    let saved_watcher = spawn_watcher(
        Arc::clone(&signals.image_saved),
        Arc::clone(&progress),
        |progress| &progress.image_saved,
        options.poll_interval,
    );

    let deadline = Instant::now() + options.timeout;
    loop {
        if progress.image_saved.load(Ordering::Acquire) {
            debug!("Renderer reported its frames saved");
            break;
        }
        if capture.is_finished() && !progress.render_stopped.load(Ordering::Acquire) {
            warn!("Capture ended before the renderer stopped");
            break;
        }
        // A watcher only exits early on a failed wait
        if (stop_watcher.is_finished() && !progress.render_stopped.load(Ordering::Acquire))
            || (saved_watcher.is_finished() && !progress.image_saved.load(Ordering::Acquire))
        {
            warn!("Signal watcher ended before its signal arrived");
            break;
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(options.poll_interval).await;
    }

    progress.finished.store(true, Ordering::Release);
    let captured = join(capture, "capture").await;
    let stopped = join(stop_watcher, "stop-render watcher").await;
    let saved = join(saved_watcher, "image-saved watcher").await;

    let CaptureOutput {
        mut captured,
        stats,
        ticks_per_second,
    } = captured?;
    stopped?;
    saved?;

    if !progress.image_saved.load(Ordering::Acquire) {
        return Err(LatencyError::Timeout {
            what:        "image-saved signal".to_string(),
            duration_ms: options.timeout.as_millis() as u64,
        });
    }

    let rendered = store.load(RENDER_IMAGE_SUFFIX)?;
    if options.save_captured {
        store.save(&captured, CAPTURE_IMAGE_SUFFIX)?;
    }
    captured.sort_by_key(|frame| frame.timestamp);

    info!(
        rendered = rendered.len(),
        captured = captured.len(),
        "Estimating latency"
    );

    let estimator =
        LatencyEstimator::new(ticks_per_second as f64)?.with_config(options.estimator)?;
    let (estimate, rendered, captured) = tokio::task::spawn_blocking(move || {
        let estimate = estimator.estimate(&rendered, &captured);
        (estimate, rendered, captured)
    })
    .await
    .map_err(|_| LatencyError::WorkerPanicked {
        worker: "estimator".to_string(),
    })?;

    info!(
        latency_ms = estimate.latency_ms,
        matches = estimate.match_count(),
        rejected = estimate.rejected,
        "Measurement finished"
    );

    Ok(MeasurementOutcome {
        estimate,
        rendered,
        captured,
        stats,
        ticks_per_second,
    })
}

fn spawn_capture<S, F>(
    open_session: F,
    regions: Vec<CaptureRegion>,
    start_render: Arc<dyn NamedSignal>,
    progress: Arc<Progress>,
) -> JoinHandle<LatencyResult<CaptureOutput>>
where
    S: FrameSource + 'static,
    F: FnOnce() -> LatencyResult<CaptureSession<S>> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut session = open_session()?;
        let ticks_per_second = session.ticks_per_second();
        let mut captured = Vec::new();

        start_render.set()?;
        debug!("Raised start-render");

        let stats = session.run_until(&regions, &progress.finished, |buffers, timestamp| {
            if progress.render_stopped.load(Ordering::Acquire) {
                return false;
            }
            if let Some(first) = buffers.first() {
                captured.push(TimestampedFrame::new(timestamp, first.clone()));
            }
            true
        })?;

        debug!(captured = captured.len(), "Capture stopped");
        Ok(CaptureOutput {
            captured,
            stats,
            ticks_per_second,
        })
    })
}

/// Waits on `signal` until it fires or the measurement finishes
fn spawn_watcher(
    signal: Arc<dyn NamedSignal>,
    progress: Arc<Progress>,
    flag: fn(&Progress) -> &AtomicBool,
    poll_interval: Duration,
) -> JoinHandle<LatencyResult<()>> {
    tokio::task::spawn_blocking(move || {
        while !progress.finished.load(Ordering::Acquire) {
            if signal.wait(poll_interval)? {
                debug!(signal = signal.name(), "Signal received");
                flag(&progress).store(true, Ordering::Release);
                return Ok(());
            }
        }
        Ok(())
    })
}

async fn join<T>(handle: JoinHandle<LatencyResult<T>>, worker: &str) -> LatencyResult<T> {
    handle.await.map_err(|e| {
        warn!(worker, error = %e, "Task failed");
        LatencyError::WorkerPanicked {
            worker: worker.to_string(),
        }
    })?
}
