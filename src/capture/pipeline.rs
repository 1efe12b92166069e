//! Producer/consumer readback pipeline
//!
//! The producer runs on the calling thread, which is the only thread that
//! touches the frame source. Each iteration it:
//!
//! 1. waits for the next compositor frame,
//! 2. timestamps it,
//! 3. copies every capture region into its own staging surface,
//! 4. releases the compositor frame,
//! 5. queues the surfaces for the consumer,
//! 6. releases a bounded number of work items the consumer is done with.
//!
//! The consumer thread reads each staging surface back into an RGBA buffer
//! (honoring the surface's row pitch), returns the work item, and hands the
//! buffers to the frame callback. The callback returning `false` stops the
//! pipeline. Work items already queued at that point are still delivered.
//!
//! The producer never waits on the consumer, so a slow consumer delays
//! surface reuse but never stalls frame acquisition.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use image::RgbaImage;
use tracing::{debug, info, trace, warn};

use super::{FrameAcquisition, FrameSource, HandoffQueue, PixelLayout, StagingSurface};
use crate::{
    clock::{Clock, PerformanceCounter},
    config::RECLAIM_PER_ITERATION,
    error::{LatencyError, LatencyResult},
    model::CaptureRegion,
};

/// Tuning knobs for [`ReadbackPipeline`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// How long a single acquisition may wait, `None` for no limit
    pub acquire_timeout:       Option<Duration>,
    /// Finished work items released per producer iteration
    pub reclaim_per_iteration: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            acquire_timeout:       None,
            reclaim_per_iteration: RECLAIM_PER_ITERATION,
        }
    }
}

impl PipelineConfig {
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

/// Counters collected over one [`ReadbackPipeline::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Updated frames copied and queued
    pub frames_acquired:             u64,
    /// Acquisitions that reported no new content
    pub unchanged_frames:            u64,
    /// Acquisitions that timed out
    pub timeouts:                    u64,
    /// Frames handed to the callback
    pub frames_delivered:            u64,
    /// Work items released, including the final drain
    pub items_reclaimed:             u64,
    /// Largest number of items released by one producer iteration
    pub max_reclaimed_per_iteration: usize,
}

/// Staging surfaces for every region of one frame
#[derive(Debug)]
pub struct WorkItem<T> {
    pub surfaces:  Vec<T>,
    pub timestamp: i64,
}

#[derive(Debug, Default)]
struct ShutdownFlags {
    stopped:       AtomicBool,
    producer_done: AtomicBool,
}

/// Raises a flag when dropped, including during unwinding
struct RaiseOnDrop<'a>(&'a AtomicBool);

impl Drop for RaiseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Concurrent acquire/readback pipeline over a [`FrameSource`]
pub struct ReadbackPipeline<S: FrameSource> {
    source: S,
    clock:  Arc<dyn Clock>,
    config: PipelineConfig,
}

impl<S: FrameSource> ReadbackPipeline<S> {
    /// Creates a pipeline timestamping with the system performance counter
    pub fn new(source: S) -> Self {
        Self {
            source,
            clock: Arc::new(PerformanceCounter),
            config: PipelineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Captures frames until `on_frame` returns `false`
    ///
    /// Every region is clamped to the current desktop bounds before capture
    /// starts. `on_frame` receives one RGBA buffer per region, in region
    /// order, together with the frame's timestamp. Timestamps are strictly
    /// increasing across calls.
    ///
    /// All staging surfaces are released before this returns, on every exit
    /// path.
    ///
    /// # Errors
    ///
    /// - `InvalidParameter` if `regions` is empty
    /// - `InvalidRegion` if a region cannot be captured
    /// - `AcquisitionFailure` if the frame source fails
    /// - `WorkerPanicked` if the callback panics
    pub fn run<F>(&mut self, regions: &[CaptureRegion], on_frame: F) -> LatencyResult<PipelineStats>
    where
        F: FnMut(&[RgbaImage], i64) -> bool + Send,
    {
        self.run_until(regions, &AtomicBool::new(false), on_frame)
    }

    /// Like [`run`](ReadbackPipeline::run), but also stops once `cancel` is set
    ///
    /// The producer checks `cancel` between acquisitions, so a cancelled
    /// pipeline stops after at most one acquisition timeout even when no
    /// new frames arrive.
    pub fn run_until<F>(
        &mut self,
        regions: &[CaptureRegion],
        cancel: &AtomicBool,
        on_frame: F,
    ) -> LatencyResult<PipelineStats>
    where
        F: FnMut(&[RgbaImage], i64) -> bool + Send,
    {
        if regions.is_empty() {
            return Err(LatencyError::InvalidParameter {
                parameter: "regions".to_string(),
                reason:    "at least one capture region is required".to_string(),
            });
        }

        let bounds = self.source.desktop_bounds()?;
        let regions = regions
            .iter()
            .map(|region| region.clamp_to(&bounds))
            .collect::<LatencyResult<Vec<_>>>()?;

        info!(
            regions = regions.len(),
            reclaim_per_iteration = self.config.reclaim_per_iteration,
            "Starting readback pipeline"
        );

        let pending = HandoffQueue::new();
        let finished = HandoffQueue::new();
        let flags = ShutdownFlags::default();
        let mut stats = PipelineStats::default();

        let (produced, consumed) = thread::scope(|scope| {
            let (pending, finished, flags) = (&pending, &finished, &flags);

            let consumer = thread::Builder::new()
                .name("readback-consumer".to_string())
                .spawn_scoped(scope, move || consume(pending, finished, flags, on_frame));
            let consumer = match consumer {
                Ok(handle) => handle,
                Err(e) => return (Err(LatencyError::IoError(e)), Ok(0)),
            };

            let produced = {
                let _done = RaiseOnDrop(&flags.producer_done);
                self.produce(&regions, pending, finished, &flags.stopped, cancel, &mut stats)
            };
            if produced.is_err() {
                flags.stopped.store(true, Ordering::Release);
            }

            let consumed = consumer.join().unwrap_or_else(|_| {
                Err(LatencyError::WorkerPanicked {
                    worker: "readback-consumer".to_string(),
                })
            });
            (produced, consumed)
        });

        let undelivered = pending.drain();
        if !undelivered.is_empty() {
            warn!(count = undelivered.len(), "Releasing undelivered frames");
        }
        let outstanding = finished.drain().len() + undelivered.len();
        drop(undelivered);
        stats.items_reclaimed += outstanding as u64;

        match (produced, consumed) {
            (Err(e), consumed) => {
                if let Err(consumer_error) = consumed {
                    warn!(error = %consumer_error, "Consumer also failed");
                }
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(delivered)) => {
                stats.frames_delivered = delivered;
                info!(
                    acquired = stats.frames_acquired,
                    delivered = stats.frames_delivered,
                    unchanged = stats.unchanged_frames,
                    timeouts = stats.timeouts,
                    "Readback pipeline stopped"
                );
                Ok(stats)
            }
        }
    }

    fn produce(
        &mut self,
        regions: &[CaptureRegion],
        pending: &HandoffQueue<WorkItem<S::Surface>>,
        finished: &HandoffQueue<WorkItem<S::Surface>>,
        stopped: &AtomicBool,
        cancel: &AtomicBool,
        stats: &mut PipelineStats,
    ) -> LatencyResult<()> {
        while !stopped.load(Ordering::Acquire) && !cancel.load(Ordering::Acquire) {
            match self.source.acquire_next_frame(self.config.acquire_timeout)? {
                FrameAcquisition::Updated => {}
                FrameAcquisition::Unchanged => {
                    stats.unchanged_frames += 1;
                    continue;
                }
                FrameAcquisition::TimedOut => {
                    stats.timeouts += 1;
                    continue;
                }
            }

            let timestamp = self.clock.now();
            let surfaces = regions
                .iter()
                .map(|region| self.source.copy_region(region))
                .collect::<LatencyResult<Vec<_>>>();
            let released = self.source.release_frame();
            let surfaces = surfaces?;
            released?;

            pending.push(WorkItem {
                surfaces,
                timestamp,
            });
            stats.frames_acquired += 1;
            trace!(timestamp, "Frame queued for readback");

            let reclaimed = reclaim(finished, self.config.reclaim_per_iteration);
            stats.items_reclaimed += reclaimed as u64;
            stats.max_reclaimed_per_iteration = stats.max_reclaimed_per_iteration.max(reclaimed);
        }
        Ok(())
    }
}

/// Releases up to `limit` finished work items without waiting
fn reclaim<T>(finished: &HandoffQueue<T>, limit: usize) -> usize {
    let mut reclaimed = 0;
    while reclaimed < limit {
        match finished.try_pop() {
            Some(item) => {
                drop(item);
                reclaimed += 1;
            }
            None => break,
        }
    }
    reclaimed
}

fn consume<T, F>(
    pending: &HandoffQueue<WorkItem<T>>,
    finished: &HandoffQueue<WorkItem<T>>,
    flags: &ShutdownFlags,
    mut on_frame: F,
) -> LatencyResult<u64>
where
    T: StagingSurface,
    F: FnMut(&[RgbaImage], i64) -> bool,
{
    // The producer must not outlive us waiting for a stop that never comes.
    let _stop = RaiseOnDrop(&flags.stopped);
    let mut delivered = 0u64;

    loop {
        let Some(item) = pending.try_pop() else {
            if flags.producer_done.load(Ordering::Acquire) && pending.is_empty() {
                break;
            }
            thread::yield_now();
            continue;
        };

        let buffers = item
            .surfaces
            .iter()
            .map(|surface| read_back(surface))
            .collect::<LatencyResult<Vec<_>>>();
        let timestamp = item.timestamp;
        finished.push(item);
        let buffers = buffers?;

        delivered += 1;
        if !on_frame(&buffers, timestamp) && !flags.stopped.swap(true, Ordering::AcqRel) {
            debug!(delivered, "Frame callback requested stop");
        }
    }

    Ok(delivered)
}

/// Copies a staging surface into a tightly packed RGBA buffer
///
/// Rows are read `row_pitch` bytes apart so padding at the end of each source
/// row is skipped. BGRA surfaces are swizzled to RGBA.
///
/// # Errors
///
/// Returns `ImageError` if the surface's pitch or byte length cannot hold its
/// declared dimensions.
pub fn read_back<T: StagingSurface + ?Sized>(surface: &T) -> LatencyResult<RgbaImage> {
    let width = surface.width();
    let height = surface.height();
    let row_bytes = width as usize * 4;
    let pitch = surface.row_pitch();
    let source = surface.bytes();

    if pitch < row_bytes {
        return Err(LatencyError::ImageError(format!(
            "row pitch {pitch} is smaller than a {width} pixel row"
        )));
    }
    let required = match height {
        0 => 0,
        h => pitch * (h as usize - 1) + row_bytes,
    };
    if source.len() < required {
        return Err(LatencyError::ImageError(format!(
            "staging surface holds {} bytes but {width}x{height} at pitch {pitch} needs {required}",
            source.len()
        )));
    }

    let mut pixels = vec![0u8; row_bytes * height as usize];
    for (y, row) in pixels.chunks_exact_mut(row_bytes.max(1)).enumerate() {
        let start = y * pitch;
        row.copy_from_slice(&source[start..start + row_bytes]);
        if surface.layout() == PixelLayout::Bgra8 {
            for pixel in row.chunks_exact_mut(4) {
                pixel.swap(0, 2);
            }
        }
    }

    RgbaImage::from_raw(width, height, pixels)
        .ok_or_else(|| LatencyError::ImageError("pixel buffer size mismatch".to_string()))
}
