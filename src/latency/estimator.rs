//! Latency estimation by aligning rendered and captured frame sequences
//!
//! For each rendered frame, in order, the estimator looks at a small window
//! of captured frames that were taken strictly after it and strictly after
//! the last captured frame already matched. The best-scoring candidate is
//! accepted when its score reaches the threshold; its timestamp difference
//! to the rendered frame is one latency sample. The estimate is the mean of
//! all samples.
//!
//! Matched captured frames are consumed: match indices strictly increase
//! over the run. A rendered frame with no acceptable candidate does not move
//! the search position.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::matcher::{ImageMatcher, NccMatcher};
use crate::{
    config::{MATCH_THRESHOLD, MATCH_WINDOW},
    error::{LatencyError, LatencyResult},
    model::{LatencyEstimate, MatchResult, TimestampedFrame},
};

/// Matching parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Captured frames considered per rendered frame
    pub window:    usize,
    /// Lowest score that counts as a match (inclusive)
    pub threshold: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            window:    MATCH_WINDOW,
            threshold: MATCH_THRESHOLD,
        }
    }
}

impl EstimatorConfig {
    /// Checks that the window is non-empty and the threshold is a valid score
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` naming the offending field.
    pub fn validate(&self) -> LatencyResult<()> {
        if self.window == 0 {
            return Err(LatencyError::InvalidParameter {
                parameter: "window".to_string(),
                reason:    "must be at least 1".to_string(),
            });
        }
        if !(-1.0..=1.0).contains(&self.threshold) {
            return Err(LatencyError::InvalidParameter {
                parameter: "threshold".to_string(),
                reason:    format!("{} is outside [-1, 1]", self.threshold),
            });
        }
        Ok(())
    }
}

/// Aligns rendered and captured sequences and averages their time offsets
pub struct LatencyEstimator<M: ImageMatcher = NccMatcher> {
    matcher:          M,
    config:           EstimatorConfig,
    ticks_per_second: f64,
}

impl LatencyEstimator<NccMatcher> {
    /// Creates an estimator using normalized cross-correlation
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if `ticks_per_second` is not a positive
    /// finite number.
    pub fn new(ticks_per_second: f64) -> LatencyResult<Self> {
        Self::with_matcher(NccMatcher, ticks_per_second)
    }
}

impl<M: ImageMatcher> LatencyEstimator<M> {
    /// Creates an estimator with a custom matcher
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if `ticks_per_second` is not a positive
    /// finite number.
    pub fn with_matcher(matcher: M, ticks_per_second: f64) -> LatencyResult<Self> {
        if !ticks_per_second.is_finite() || ticks_per_second <= 0.0 {
            return Err(LatencyError::InvalidParameter {
                parameter: "ticks_per_second".to_string(),
                reason:    format!("{ticks_per_second} is not a positive tick rate"),
            });
        }
        Ok(Self {
            matcher,
            config: EstimatorConfig::default(),
            ticks_per_second,
        })
    }

    /// Replaces the matching parameters
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if the configuration is invalid.
    pub fn with_config(mut self, config: EstimatorConfig) -> LatencyResult<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn ticks_per_second(&self) -> f64 {
        self.ticks_per_second
    }

    /// Mean latency in milliseconds, `0.0` when nothing matched
    pub fn estimate_ms(&self, rendered: &[TimestampedFrame], captured: &[TimestampedFrame]) -> f64 {
        self.estimate(rendered, captured).latency_ms
    }

    /// Aligns `rendered` against `captured`
    ///
    /// Both sequences must be sorted by strictly increasing timestamp. At
    /// most `min(rendered.len(), captured.len())` rendered frames are
    /// considered, and estimation stops early once no captured frame is
    /// newer than the current rendered frame.
    pub fn estimate(
        &self,
        rendered: &[TimestampedFrame],
        captured: &[TimestampedFrame],
    ) -> LatencyEstimate {
        let usable = rendered.len().min(captured.len());
        let mut next_start = 0usize;
        let mut total_ms = 0.0;
        let mut matches = Vec::new();
        let mut rejected = 0;

        for (rendered_index, frame) in rendered.iter().enumerate().take(usable) {
            let mut start = next_start;
            while start < captured.len() && captured[start].timestamp <= frame.timestamp {
                start += 1;
            }
            if start >= captured.len() {
                debug!(rendered_index, "No captured frames after this rendered frame");
                break;
            }

            let end = start + self.config.window.min(captured.len() - start);
            match self.best_candidate(rendered_index, frame, &captured[start..end]) {
                Some((offset, score)) if score >= self.config.threshold => {
                    let captured_index = start + offset;
                    let ticks = captured[captured_index]
                        .timestamp
                        .saturating_sub(frame.timestamp);
                    let latency_ms = ticks as f64 * 1000.0 / self.ticks_per_second;

                    total_ms += latency_ms;
                    matches.push(MatchResult {
                        rendered_index,
                        captured_index,
                        score,
                        latency_ms,
                    });
                    next_start = captured_index + 1;
                }
                best => {
                    rejected += 1;
                    debug!(
                        rendered_index,
                        best_score = ?best.map(|(_, score)| score),
                        "Rendered frame not matched"
                    );
                }
            }
        }

        let latency_ms = if matches.is_empty() {
            0.0
        } else {
            total_ms / matches.len() as f64
        };
        debug!(latency_ms, matched = matches.len(), rejected, "Estimation finished");

        LatencyEstimate {
            latency_ms,
            matches,
            rejected,
        }
    }

    /// Highest-scoring candidate as `(offset, score)`, first one on ties
    ///
    /// Candidates that cannot be scored are skipped.
    fn best_candidate(
        &self,
        rendered_index: usize,
        frame: &TimestampedFrame,
        candidates: &[TimestampedFrame],
    ) -> Option<(usize, f64)> {
        let Some(rendered) = frame.pixels.as_ref() else {
            warn!(rendered_index, "Rendered frame has no pixels");
            return None;
        };

        let mut best: Option<(usize, f64)> = None;
        for (offset, candidate) in candidates.iter().enumerate() {
            let Some(pixels) = candidate.pixels.as_ref() else {
                continue;
            };
            let score = match self.matcher.score(rendered, pixels) {
                Ok(score) if score.is_nan() => continue,
                Ok(score) => score,
                Err(e) => {
                    warn!(rendered_index, offset, error = %e, "Skipping candidate");
                    continue;
                }
            };
            if best.is_none_or(|(_, best_score)| score > best_score) {
                best = Some((offset, score));
            }
        }
        best
    }
}
