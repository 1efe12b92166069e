//! display-latency: end-to-end display latency measurement
//!
//! This library measures the delay between a renderer submitting a frame and
//! that frame appearing on screen. Desktop frames are captured through
//! desktop duplication (DXGI on Windows), read back into RGBA buffers by a
//! producer/consumer pipeline, and aligned against the renderer's own
//! timestamped frames using normalized cross-correlation.

pub mod capture;
pub mod clock;
pub mod config;
pub mod error;
pub mod latency;
pub mod measure;
pub mod model;
pub mod signal;
pub mod util;
