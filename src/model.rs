//! Data models and type definitions for display-latency
//!
//! This module defines the core types shared by the capture pipeline and the
//! latency estimator:
//! - Desktop geometry (bounds and capture regions)
//! - Timestamped frames produced by the renderer and by screen capture
//! - Match results and the serializable latency report

use std::{fmt, str::FromStr};

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::error::{LatencyError, LatencyResult};

/// Frame source backend used for screen capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// DXGI Desktop Duplication (Windows)
    Dxgi,
    /// Scripted in-memory frame source
    Mock,
}

impl BackendType {
    /// Returns the backend type as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Dxgi => "dxgi",
            BackendType::Mock => "mock",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = LatencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dxgi" => Ok(BackendType::Dxgi),
            "mock" => Ok(BackendType::Mock),
            other => Err(LatencyError::InvalidParameter {
                parameter: "backend".to_string(),
                reason:    format!("unknown backend '{other}', expected 'dxgi' or 'mock'"),
            }),
        }
    }
}

/// Desktop-space bounds of the duplicated output
///
/// `right` and `bottom` are exclusive, matching the coordinates reported by
/// the compositor for the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesktopBounds {
    pub left:   i32,
    pub top:    i32,
    pub right:  i32,
    pub bottom: i32,
}

impl DesktopBounds {
    /// Creates bounds for an output of the given size at the desktop origin
    pub fn from_size(width: u32, height: u32) -> Self {
        Self {
            left:   0,
            top:    0,
            right:  width as i32,
            bottom: height as i32,
        }
    }

    /// Width of the output in pixels
    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    /// Height of the output in pixels
    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

/// Rectangular capture region in desktop coordinates
///
/// Regions are parsed from the CLI as `x,y,width,height`.
///
/// # Examples
///
/// ```
/// use display_latency::model::{CaptureRegion, DesktopBounds};
///
/// let bounds = DesktopBounds::from_size(1920, 1080);
/// let region: CaptureRegion = "1800,1000,400,400".parse().unwrap();
///
/// let clamped = region.clamp_to(&bounds).unwrap();
/// assert_eq!((clamped.width, clamped.height), (120, 80));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureRegion {
    pub x:      i32,
    pub y:      i32,
    pub width:  i32,
    pub height: i32,
}

impl CaptureRegion {
    /// Creates a new capture region
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Region covering the whole output
    pub fn full(bounds: &DesktopBounds) -> Self {
        Self::new(bounds.left, bounds.top, bounds.width(), bounds.height())
    }

    /// Clamps the region so it never extends past the output's right or
    /// bottom edge
    ///
    /// Width and height are shrunk to `right - x` and `bottom - y`. A region
    /// whose origin lies outside the output, or whose size is non-positive
    /// after clamping, is rejected with [`LatencyError::InvalidRegion`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegion` if the region cannot be captured from `bounds`.
    pub fn clamp_to(&self, bounds: &DesktopBounds) -> LatencyResult<CaptureRegion> {
        if self.x < bounds.left || self.y < bounds.top {
            return Err(self.invalid(format!(
                "origin lies before the desktop origin ({}, {})",
                bounds.left, bounds.top
            )));
        }
        if self.width <= 0 || self.height <= 0 {
            return Err(self.invalid("width and height must be positive".to_string()));
        }

        let width = self.width.min(bounds.right.saturating_sub(self.x));
        let height = self.height.min(bounds.bottom.saturating_sub(self.y));
        if width <= 0 || height <= 0 {
            return Err(self.invalid(format!(
                "region lies outside the {}x{} desktop",
                bounds.width(),
                bounds.height()
            )));
        }

        Ok(CaptureRegion::new(self.x, self.y, width, height))
    }

    fn invalid(&self, reason: String) -> LatencyError {
        LatencyError::InvalidRegion {
            region: *self,
            reason,
        }
    }
}

impl fmt::Display for CaptureRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} at ({}, {})", self.width, self.height, self.x, self.y)
    }
}

impl FromStr for CaptureRegion {
    type Err = LatencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|part| part.trim().parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LatencyError::InvalidParameter {
                parameter: "region".to_string(),
                reason:    format!("'{s}' is not a list of integers: {e}"),
            })?;

        match parts.as_slice() {
            [x, y, width, height] => Ok(CaptureRegion::new(*x, *y, *width, *height)),
            _ => Err(LatencyError::InvalidParameter {
                parameter: "region".to_string(),
                reason:    format!("expected x,y,width,height but got '{s}'"),
            }),
        }
    }
}

/// A frame stamped with the monotonic clock tick at which it was produced
///
/// Rendered frames carry the tick at which they were submitted for
/// presentation; captured frames carry the tick taken right after the
/// compositor handed the frame over. Pixels are absent for frames that were
/// timestamped but never read back.
#[derive(Debug, Clone)]
pub struct TimestampedFrame {
    pub timestamp: i64,
    pub pixels:    Option<RgbaImage>,
}

impl TimestampedFrame {
    /// Creates a frame with pixel data
    pub fn new(timestamp: i64, pixels: RgbaImage) -> Self {
        Self {
            timestamp,
            pixels: Some(pixels),
        }
    }

    /// Creates a frame carrying only a timestamp
    pub fn without_pixels(timestamp: i64) -> Self {
        Self {
            timestamp,
            pixels: None,
        }
    }
}

/// One accepted rendered/captured pairing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Index into the rendered sequence
    pub rendered_index: usize,
    /// Index into the captured sequence
    pub captured_index: usize,
    /// Similarity score of the pairing
    pub score:          f64,
    /// Capture minus render time, in milliseconds
    pub latency_ms:     f64,
}

/// Outcome of a latency estimation
///
/// `latency_ms` is the mean over all accepted matches, or `0.0` when none
/// were accepted. Use [`LatencyEstimate::match_count`] to tell "no data"
/// apart from a genuine zero latency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyEstimate {
    pub latency_ms: f64,
    pub matches:    Vec<MatchResult>,
    /// Rendered frames whose best candidate scored below the threshold
    pub rejected:   usize,
}

impl LatencyEstimate {
    /// Number of accepted matches
    pub fn match_count(&self) -> usize {
        self.matches.len()
    }

    /// True when no rendered frame could be matched
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Serializable summary printed by the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyReport {
    pub latency_ms:       f64,
    pub match_count:      usize,
    pub rejected:         usize,
    pub rendered_frames:  usize,
    pub captured_frames:  usize,
    pub ticks_per_second: f64,
    pub matches:          Vec<MatchResult>,
}

impl LatencyReport {
    /// Builds a report from an estimate and the sizes of its inputs
    pub fn new(
        estimate: LatencyEstimate,
        rendered_frames: usize,
        captured_frames: usize,
        ticks_per_second: f64,
    ) -> Self {
        Self {
            latency_ms: estimate.latency_ms,
            match_count: estimate.match_count(),
            rejected: estimate.rejected,
            rendered_frames,
            captured_frames,
            ticks_per_second,
            matches: estimate.matches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> DesktopBounds {
        DesktopBounds::from_size(1920, 1080)
    }

    #[test]
    fn test_backend_type_serialization() {
        let json = serde_json::to_string(&BackendType::Dxgi).unwrap();
        assert_eq!(json, "\"dxgi\"");

        let parsed: BackendType = serde_json::from_str("\"mock\"").unwrap();
        assert_eq!(parsed, BackendType::Mock);
    }

    #[test]
    fn test_backend_type_from_str() {
        assert_eq!("DXGI".parse::<BackendType>().unwrap(), BackendType::Dxgi);
        assert!("wayland".parse::<BackendType>().is_err());
    }

    #[test]
    fn test_region_inside_bounds_unchanged() {
        let region = CaptureRegion::new(10, 20, 300, 200);
        assert_eq!(region.clamp_to(&bounds()).unwrap(), region);
    }

    #[test]
    fn test_region_clamped_to_right_and_bottom() {
        let region = CaptureRegion::new(1800, 1000, 400, 400);
        let clamped = region.clamp_to(&bounds()).unwrap();
        assert_eq!(clamped, CaptureRegion::new(1800, 1000, 120, 80));
    }

    #[test]
    fn test_region_clamp_never_escapes_bounds() {
        let bounds = bounds();
        for (x, y, w, h) in [(0, 0, 5000, 5000), (1919, 1079, 2, 2), (960, 0, 961, 1080)] {
            let clamped = CaptureRegion::new(x, y, w, h).clamp_to(&bounds).unwrap();
            assert!(clamped.x + clamped.width <= bounds.right);
            assert!(clamped.y + clamped.height <= bounds.bottom);
            assert!(clamped.width > 0 && clamped.height > 0);
        }
    }

    #[test]
    fn test_region_negative_origin_rejected() {
        let err = CaptureRegion::new(-1, 0, 10, 10).clamp_to(&bounds()).unwrap_err();
        assert!(matches!(err, LatencyError::InvalidRegion { .. }));
    }

    #[test]
    fn test_region_zero_size_rejected() {
        let err = CaptureRegion::new(0, 0, 0, 10).clamp_to(&bounds()).unwrap_err();
        assert!(matches!(err, LatencyError::InvalidRegion { .. }));
    }

    #[test]
    fn test_region_outside_desktop_rejected() {
        let err = CaptureRegion::new(1920, 0, 10, 10).clamp_to(&bounds()).unwrap_err();
        assert!(matches!(err, LatencyError::InvalidRegion { .. }));
    }

    #[test]
    fn test_region_respects_offset_desktop() {
        let bounds = DesktopBounds {
            left:   -1920,
            top:    0,
            right:  0,
            bottom: 1080,
        };
        let clamped = CaptureRegion::new(-100, 0, 500, 50).clamp_to(&bounds).unwrap();
        assert_eq!(clamped.width, 100);
    }

    #[test]
    fn test_region_parse() {
        let region: CaptureRegion = "10, 20,300,200".parse().unwrap();
        assert_eq!(region, CaptureRegion::new(10, 20, 300, 200));

        assert!("10,20,300".parse::<CaptureRegion>().is_err());
        assert!("a,b,c,d".parse::<CaptureRegion>().is_err());
    }

    #[test]
    fn test_region_display() {
        let region = CaptureRegion::new(1, 2, 3, 4);
        assert_eq!(region.to_string(), "3x4 at (1, 2)");
    }

    #[test]
    fn test_estimate_distinguishes_empty() {
        let estimate = LatencyEstimate::default();
        assert!(estimate.is_empty());
        assert_eq!(estimate.latency_ms, 0.0);
    }

    #[test]
    fn test_report_serialization() {
        let estimate = LatencyEstimate {
            latency_ms: 50.0,
            matches:    vec![MatchResult {
                rendered_index: 0,
                captured_index: 1,
                score:          0.97,
                latency_ms:     50.0,
            }],
            rejected:   2,
        };
        let report = LatencyReport::new(estimate, 3, 4, 1000.0);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"latency_ms\":50.0"));
        assert!(json.contains("\"match_count\":1"));
        assert!(json.contains("\"rejected\":2"));
    }
}
