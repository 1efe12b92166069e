//! Screen capture: frame sources and the readback pipeline
//!
//! This module provides the abstractions for pulling frames off the
//! compositor and turning them into CPU-side RGBA buffers:
//!
//! - [`FrameSource`]: trait over a desktop duplication API that yields the
//!   next updated frame, copies regions of it into CPU-readable staging
//!   surfaces, and releases it again
//! - [`StagingSurface`]: a mapped, CPU-readable copy of one region
//! - [`ReadbackPipeline`]: producer/consumer pipeline that keeps the
//!   compositor fed while the consumer reads surfaces back
//! - [`CaptureSession`]: owns a frame source and drives the pipeline
//! - Backends: DXGI Desktop Duplication (Windows) and a scripted mock

use std::time::Duration;

use crate::{
    error::LatencyResult,
    model::{CaptureRegion, DesktopBounds},
};

pub mod mock;
pub mod pipeline;
pub mod queue;
pub mod session;

#[cfg(all(target_os = "windows", feature = "dxgi-backend"))]
pub mod dxgi_backend;

#[cfg(all(target_os = "windows", feature = "dxgi-backend"))]
pub use dxgi_backend::{DxgiFrameSource, DxgiStagingSurface};
pub use mock::{MockEvent, MockFrameSource, MockSurface};
pub use pipeline::{PipelineConfig, PipelineStats, ReadbackPipeline};
pub use queue::HandoffQueue;
pub use session::CaptureSession;

/// Outcome of waiting for the next compositor frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAcquisition {
    /// A new frame is held and must be released with
    /// [`FrameSource::release_frame`]
    Updated,
    /// The compositor reported no new content; nothing is held
    Unchanged,
    /// The wait elapsed without a frame; nothing is held
    TimedOut,
}

/// Byte order of pixels in a staging surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// Blue, green, red, alpha (the desktop duplication format)
    Bgra8,
    /// Red, green, blue, alpha
    Rgba8,
}

/// CPU-readable copy of one capture region
///
/// Rows are `row_pitch()` bytes apart, which may exceed `width() * 4`.
/// Implementations release their GPU resources on drop.
pub trait StagingSurface: Send {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// Distance in bytes between the starts of consecutive rows
    fn row_pitch(&self) -> usize;

    fn layout(&self) -> PixelLayout;

    /// Mapped pixel bytes, at least `row_pitch * (height - 1) + width * 4`
    /// long
    fn bytes(&self) -> &[u8];
}

/// Source of desktop frames
///
/// Only one frame is held at a time. A caller that receives
/// [`FrameAcquisition::Updated`] copies the regions it needs and then calls
/// [`release_frame`](FrameSource::release_frame) before acquiring again.
///
/// Frame sources are driven from a single thread; the surfaces they hand out
/// may be read from another thread but are dropped on the driving thread.
pub trait FrameSource {
    type Surface: StagingSurface;

    /// Current bounds of the duplicated output
    fn desktop_bounds(&self) -> LatencyResult<DesktopBounds>;

    /// Waits up to `timeout` for the next frame, or forever when `None`
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionFailure` for anything other than a timeout.
    fn acquire_next_frame(&mut self, timeout: Option<Duration>)
    -> LatencyResult<FrameAcquisition>;

    /// Copies a region of the held frame into a new staging surface
    ///
    /// `region` must already be clamped to [`desktop_bounds`].
    ///
    /// [`desktop_bounds`]: FrameSource::desktop_bounds
    fn copy_region(&mut self, region: &CaptureRegion) -> LatencyResult<Self::Surface>;

    /// Hands the held frame back to the compositor
    fn release_frame(&mut self) -> LatencyResult<()>;
}
