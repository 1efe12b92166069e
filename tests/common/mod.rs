//! Shared test utilities for integration tests

#![allow(dead_code)]

use std::collections::HashMap;

use display_latency::{
    capture::mock::test_pattern,
    error::LatencyResult,
    latency::ImageMatcher,
    model::TimestampedFrame,
};
use image::{Rgba, RgbaImage};

/// 1x1 frame whose red channel identifies it
pub fn id_frame(timestamp: i64, id: u8) -> TimestampedFrame {
    TimestampedFrame::new(timestamp, RgbaImage::from_pixel(1, 1, Rgba([id, 0, 0, 255])))
}

/// Test pattern frames `first_pattern..` stamped with `timestamps`
pub fn pattern_frames(
    width: u32,
    height: u32,
    timestamps: &[i64],
    first_pattern: usize,
) -> Vec<TimestampedFrame> {
    timestamps
        .iter()
        .enumerate()
        .map(|(i, &ts)| TimestampedFrame::new(ts, test_pattern(width, height, first_pattern + i)))
        .collect()
}

/// Matcher with scripted scores between [`id_frame`] ids
///
/// Equal ids score `1.0` unless overridden; unknown pairs score `0.0`.
#[derive(Debug, Default)]
pub struct TableMatcher {
    scores: HashMap<(u8, u8), f64>,
}

impl TableMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the score of rendered id `a` against captured id `b`
    pub fn with_score(mut self, a: u8, b: u8, score: f64) -> Self {
        self.scores.insert((a, b), score);
        self
    }
}

impl ImageMatcher for TableMatcher {
    fn score(&self, a: &RgbaImage, b: &RgbaImage) -> LatencyResult<f64> {
        let (a, b) = (a.get_pixel(0, 0).0[0], b.get_pixel(0, 0).0[0]);
        let default = if a == b { 1.0 } else { 0.0 };
        Ok(self.scores.get(&(a, b)).copied().unwrap_or(default))
    }
}
