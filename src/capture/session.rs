//! Capture session: frame source lifetime plus pipeline driving

use std::sync::{Arc, atomic::AtomicBool};

use image::RgbaImage;
use tracing::{debug, info};

#[cfg(all(target_os = "windows", feature = "dxgi-backend"))]
use super::DxgiFrameSource;
use super::{FrameSource, PipelineConfig, PipelineStats, ReadbackPipeline};
use crate::{
    clock::Clock,
    error::{LatencyError, LatencyResult},
    model::{CaptureRegion, DesktopBounds, TimestampedFrame},
};

/// Owns a frame source and runs capture passes over it
///
/// The frame source (and with it the device, adapter, and duplication
/// objects) lives exactly as long as the session. A session can run any
/// number of capture passes one after another.
pub struct CaptureSession<S: FrameSource> {
    pipeline: ReadbackPipeline<S>,
}

#[cfg(all(target_os = "windows", feature = "dxgi-backend"))]
impl CaptureSession<DxgiFrameSource> {
    /// Opens desktop duplication on the first output of the first adapter
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionFailure` if any of the graphics objects cannot be
    /// created.
    pub fn open_primary() -> LatencyResult<Self> {
        Ok(Self::new(DxgiFrameSource::open(0, 0)?))
    }
}

impl<S: FrameSource> CaptureSession<S> {
    pub fn new(source: S) -> Self {
        Self {
            pipeline: ReadbackPipeline::new(source),
        }
    }

    pub fn with_config(self, config: PipelineConfig) -> Self {
        Self {
            pipeline: self.pipeline.with_config(config),
        }
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self {
            pipeline: self.pipeline.with_clock(clock),
        }
    }

    /// Tick rate of the timestamps handed to callbacks
    pub fn ticks_per_second(&self) -> i64 {
        self.pipeline.clock().ticks_per_second()
    }

    pub fn desktop_bounds(&self) -> LatencyResult<DesktopBounds> {
        self.pipeline.source().desktop_bounds()
    }

    pub fn source(&self) -> &S {
        self.pipeline.source()
    }

    pub fn into_source(self) -> S {
        self.pipeline.into_source()
    }

    /// Captures until `on_frame` returns `false`
    ///
    /// See [`ReadbackPipeline::run`] for the callback contract.
    pub fn run<F>(&mut self, regions: &[CaptureRegion], on_frame: F) -> LatencyResult<PipelineStats>
    where
        F: FnMut(&[RgbaImage], i64) -> bool + Send,
    {
        info!(regions = ?regions, "Capture session starting");
        let stats = self.pipeline.run(regions, on_frame)?;
        debug!(?stats, "Capture session finished");
        Ok(stats)
    }

    /// Captures until `on_frame` returns `false` or `cancel` is set
    pub fn run_until<F>(
        &mut self,
        regions: &[CaptureRegion],
        cancel: &AtomicBool,
        on_frame: F,
    ) -> LatencyResult<PipelineStats>
    where
        F: FnMut(&[RgbaImage], i64) -> bool + Send,
    {
        info!(regions = ?regions, "Capture session starting");
        let stats = self.pipeline.run_until(regions, cancel, on_frame)?;
        debug!(?stats, "Capture session finished");
        Ok(stats)
    }

    /// Captures `frames` frames and returns them grouped by region
    ///
    /// The outer vector has one entry per region, each holding `frames`
    /// frames in capture order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if `frames` is zero, otherwise the errors of
    /// [`run`](CaptureSession::run).
    pub fn collect(
        &mut self,
        regions: &[CaptureRegion],
        frames: usize,
    ) -> LatencyResult<Vec<Vec<TimestampedFrame>>> {
        if frames == 0 {
            return Err(LatencyError::InvalidParameter {
                parameter: "frames".to_string(),
                reason:    "must be at least 1".to_string(),
            });
        }

        let mut collected: Vec<Vec<TimestampedFrame>> =
            regions.iter().map(|_| Vec::with_capacity(frames)).collect();
        let mut count = 0;

        self.run(regions, |buffers, timestamp| {
            if count < frames {
                for (frames_for_region, buffer) in collected.iter_mut().zip(buffers) {
                    frames_for_region.push(TimestampedFrame::new(timestamp, buffer.clone()));
                }
                count += 1;
            }
            count < frames
        })?;

        Ok(collected)
    }
}
