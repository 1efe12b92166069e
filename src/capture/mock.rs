//! Mock frame source for testing
//!
//! This module provides a `MockFrameSource` implementation of the
//! [`FrameSource`] trait for tests and for running the capture command
//! without a compositor. The source replays a script of events: updated
//! frames, "no change" reports, timeouts, and failures.
//!
//! # Features
//!
//! - **Scripted Frames:** Replays full-desktop RGBA images in order
//! - **Synthetic Animation:** [`MockFrameSource::animated`] generates a moving
//!   test pattern
//! - **Realistic Surfaces:** Staging surfaces are BGRA with padded rows by
//!   default, like desktop duplication
//! - **Leak Tracking:** Counts live staging surfaces so tests can assert every
//!   one was released
//! - **Configurable Delay:** Simulates a display refresh interval
//! - **Error Injection:** Fails acquisitions or region copies on demand
//!
//! # Examples
//!
//! ```
//! use display_latency::{
//!     capture::{CaptureSession, MockFrameSource},
//!     model::CaptureRegion,
//! };
//!
//! let source = MockFrameSource::animated(64, 48, 5);
//! let live = source.live_surfaces();
//! let mut session = CaptureSession::new(source);
//!
//! let frames = session.collect(&[CaptureRegion::new(0, 0, 32, 24)], 5).unwrap();
//! assert_eq!(frames[0].len(), 5);
//! assert_eq!(live.load(std::sync::atomic::Ordering::SeqCst), 0);
//! ```

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use image::{Rgba, RgbaImage};

use super::{FrameAcquisition, FrameSource, PixelLayout, StagingSurface};
use crate::{
    error::{LatencyError, LatencyResult},
    model::{CaptureRegion, DesktopBounds},
};

/// Row alignment used for mock staging surfaces
pub const DEFAULT_ROW_ALIGNMENT: usize = 256;

/// Byte used to fill row padding, so reading it shows up in tests
const PADDING_BYTE: u8 = 0xCD;

/// Idle wait once the script is exhausted
const EXHAUSTED_WAIT: Duration = Duration::from_millis(1);

/// One step of a mock script
#[derive(Debug, Clone)]
pub enum MockEvent {
    /// A new frame covering the whole desktop
    Frame(RgbaImage),
    /// The compositor reports no new content
    Unchanged,
    /// The acquisition wait elapses
    TimedOut,
    /// The acquisition fails
    Fail(String),
}

/// Scripted frame source
///
/// Once the script runs out every acquisition reports
/// [`FrameAcquisition::TimedOut`], as a static desktop would.
#[derive(Debug)]
pub struct MockFrameSource {
    bounds:        DesktopBounds,
    script:        VecDeque<MockEvent>,
    held:          Option<RgbaImage>,
    /// Optional delay before each acquisition returns
    delay:         Option<Duration>,
    layout:        PixelLayout,
    row_alignment: usize,
    /// Error returned from every region copy
    copy_error:    Option<String>,
    live_surfaces: Arc<AtomicUsize>,
    released:      usize,
}

impl MockFrameSource {
    /// Creates a source for a `width` x `height` desktop with an empty script
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            bounds:        DesktopBounds::from_size(width, height),
            script:        VecDeque::new(),
            held:          None,
            delay:         None,
            layout:        PixelLayout::Bgra8,
            row_alignment: DEFAULT_ROW_ALIGNMENT,
            copy_error:    None,
            live_surfaces: Arc::new(AtomicUsize::new(0)),
            released:      0,
        }
    }

    /// Creates a source that plays `frames` distinct test pattern frames
    pub fn animated(width: u32, height: u32, frames: usize) -> Self {
        Self::new(width, height).with_frames((0..frames).map(|i| test_pattern(width, height, i)))
    }

    /// Places the desktop at a non-zero origin
    pub fn with_bounds(mut self, bounds: DesktopBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Appends frames to the script
    pub fn with_frames(mut self, frames: impl IntoIterator<Item = RgbaImage>) -> Self {
        self.script.extend(frames.into_iter().map(MockEvent::Frame));
        self
    }

    /// Appends arbitrary events to the script
    pub fn with_events(mut self, events: impl IntoIterator<Item = MockEvent>) -> Self {
        self.script.extend(events);
        self
    }

    /// Sleeps for `delay` on every acquisition
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_layout(mut self, layout: PixelLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Pads staging rows to a multiple of `alignment` bytes
    pub fn with_row_alignment(mut self, alignment: usize) -> Self {
        self.row_alignment = alignment.max(1);
        self
    }

    /// Makes every region copy fail with `AcquisitionFailure`
    pub fn with_copy_error(mut self, reason: impl Into<String>) -> Self {
        self.copy_error = Some(reason.into());
        self
    }

    /// Shared count of staging surfaces not yet dropped
    pub fn live_surfaces(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live_surfaces)
    }

    /// Number of frames released back to the "compositor"
    pub fn released_frames(&self) -> usize {
        self.released
    }

    /// True while a frame is acquired and not yet released
    pub fn is_holding_frame(&self) -> bool {
        self.held.is_some()
    }

    /// Events left in the script
    pub fn remaining_events(&self) -> usize {
        self.script.len()
    }
}

impl FrameSource for MockFrameSource {
    type Surface = MockSurface;

    fn desktop_bounds(&self) -> LatencyResult<DesktopBounds> {
        Ok(self.bounds)
    }

    fn acquire_next_frame(
        &mut self,
        timeout: Option<Duration>,
    ) -> LatencyResult<FrameAcquisition> {
        if self.held.is_some() {
            return Err(LatencyError::AcquisitionFailure {
                reason: "previous frame was not released".to_string(),
            });
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        match self.script.pop_front() {
            Some(MockEvent::Frame(image)) => {
                self.held = Some(image);
                Ok(FrameAcquisition::Updated)
            }
            Some(MockEvent::Unchanged) => Ok(FrameAcquisition::Unchanged),
            Some(MockEvent::TimedOut) => Ok(FrameAcquisition::TimedOut),
            Some(MockEvent::Fail(reason)) => Err(LatencyError::AcquisitionFailure { reason }),
            None => {
                thread::sleep(timeout.unwrap_or(EXHAUSTED_WAIT).min(EXHAUSTED_WAIT));
                Ok(FrameAcquisition::TimedOut)
            }
        }
    }

    fn copy_region(&mut self, region: &CaptureRegion) -> LatencyResult<MockSurface> {
        if let Some(reason) = &self.copy_error {
            return Err(LatencyError::AcquisitionFailure {
                reason: reason.clone(),
            });
        }
        let frame = self
            .held
            .as_ref()
            .ok_or_else(|| LatencyError::AcquisitionFailure {
                reason: "no frame is held".to_string(),
            })?;

        let x = (region.x - self.bounds.left) as u32;
        let y = (region.y - self.bounds.top) as u32;
        let (width, height) = (region.width as u32, region.height as u32);
        if x + width > frame.width() || y + height > frame.height() {
            return Err(LatencyError::AcquisitionFailure {
                reason: format!(
                    "region {region} exceeds the {}x{} mock frame",
                    frame.width(),
                    frame.height()
                ),
            });
        }

        let row_bytes = width as usize * 4;
        let row_pitch = row_bytes.div_ceil(self.row_alignment) * self.row_alignment;
        let mut bytes = vec![PADDING_BYTE; row_pitch * height as usize];
        for row in 0..height {
            let start = row as usize * row_pitch;
            for col in 0..width {
                let Rgba([r, g, b, a]) = *frame.get_pixel(x + col, y + row);
                let offset = start + col as usize * 4;
                let pixel = match self.layout {
                    PixelLayout::Bgra8 => [b, g, r, a],
                    PixelLayout::Rgba8 => [r, g, b, a],
                };
                bytes[offset..offset + 4].copy_from_slice(&pixel);
            }
        }

        Ok(MockSurface::tracked(
            width,
            height,
            row_pitch,
            self.layout,
            bytes,
            Arc::clone(&self.live_surfaces),
        ))
    }

    fn release_frame(&mut self) -> LatencyResult<()> {
        match self.held.take() {
            Some(_) => {
                self.released += 1;
                Ok(())
            }
            None => Err(LatencyError::AcquisitionFailure {
                reason: "release without a held frame".to_string(),
            }),
        }
    }
}

/// In-memory staging surface
#[derive(Debug)]
pub struct MockSurface {
    width:     u32,
    height:    u32,
    row_pitch: usize,
    layout:    PixelLayout,
    bytes:     Vec<u8>,
    live:      Option<Arc<AtomicUsize>>,
}

impl MockSurface {
    /// Creates a surface that is not counted by any source
    pub fn detached(
        width: u32,
        height: u32,
        row_pitch: usize,
        layout: PixelLayout,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            width,
            height,
            row_pitch,
            layout,
            bytes,
            live: None,
        }
    }

    fn tracked(
        width: u32,
        height: u32,
        row_pitch: usize,
        layout: PixelLayout,
        bytes: Vec<u8>,
        live: Arc<AtomicUsize>,
    ) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            width,
            height,
            row_pitch,
            layout,
            bytes,
            live: Some(live),
        }
    }
}

impl StagingSurface for MockSurface {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    fn layout(&self) -> PixelLayout {
        self.layout
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for MockSurface {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Generates a gradient with a bar whose position depends on `index`
///
/// Consecutive indices produce visibly different images, which keeps the
/// frames distinguishable by the correlation matcher.
pub fn test_pattern(width: u32, height: u32, index: usize) -> RgbaImage {
    let bar_width = (width / 8).max(1);
    let bar_start = (index as u32).wrapping_mul(bar_width) % width.max(1);
    RgbaImage::from_fn(width, height, |x, y| {
        if x >= bar_start && x < bar_start + bar_width {
            Rgba([255, 255, 255, 255])
        } else {
            let r = ((x * 255) / width.max(1)) as u8;
            let g = ((y * 255) / height.max(1)) as u8;
            let b = ((index * 37) % 256) as u8;
            Rgba([r, g, b, 255])
        }
    })
}
