//! Centralized constants and runtime configuration for latency measurement.
//!
//! # Runtime Configuration
//!
//! Timeouts can be overridden at runtime via environment variables:
//!
//! | Environment Variable | Default | Description |
//! |---------------------|---------|-------------|
//! | `DISPLAY_LATENCY_ACQUIRE_TIMEOUT_MS` | 500 | Per-call frame acquisition wait used by the CLI |
//! | `DISPLAY_LATENCY_MEASURE_TIMEOUT_SECS` | 60 | Wait for the renderer to save its frames |
//! | `DISPLAY_LATENCY_SIGNAL_POLL_MS` | 100 | Signal watcher poll interval |
//!
//! The library itself waits without a deadline for new frames unless a
//! [`PipelineConfig`](crate::capture::PipelineConfig) says otherwise; a
//! finite acquisition timeout only makes the producer notice a stop request
//! sooner on a static desktop.

use std::time::Duration;

/// Number of captured frames compared against each rendered frame.
pub const MATCH_WINDOW: usize = 10;

/// Minimum normalized cross-correlation score for a match to count.
pub const MATCH_THRESHOLD: f64 = 0.9;

/// Maximum finished work items released by the producer per iteration.
pub const RECLAIM_PER_ITERATION: usize = 3;

/// Acquisition wait used by the CLI.
pub const ACQUIRE_TIMEOUT_MS: u64 = 500;

/// How long the measurer waits for the renderer to finish.
pub const MEASURE_TIMEOUT_SECS: u64 = 60;

/// Poll interval of the signal watchers.
pub const SIGNAL_POLL_MS: u64 = 100;

// =============================================================================
// Environment Variable Overrides
// =============================================================================

fn get_timeout_from_env(env_var: &str, default: u64) -> u64 {
    std::env::var(env_var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Frame acquisition timeout for CLI captures.
///
/// Override with: `DISPLAY_LATENCY_ACQUIRE_TIMEOUT_MS`
pub fn acquire_timeout() -> Duration {
    Duration::from_millis(get_timeout_from_env(
        "DISPLAY_LATENCY_ACQUIRE_TIMEOUT_MS",
        ACQUIRE_TIMEOUT_MS,
    ))
}

/// Deadline for the renderer to report its frames saved.
///
/// Override with: `DISPLAY_LATENCY_MEASURE_TIMEOUT_SECS`
///
/// # Example
///
/// ```bash
/// # Give a slow renderer five minutes
/// export DISPLAY_LATENCY_MEASURE_TIMEOUT_SECS=300
/// ```
pub fn measure_timeout() -> Duration {
    Duration::from_secs(get_timeout_from_env(
        "DISPLAY_LATENCY_MEASURE_TIMEOUT_SECS",
        MEASURE_TIMEOUT_SECS,
    ))
}

/// Poll interval of the signal watchers.
///
/// Override with: `DISPLAY_LATENCY_SIGNAL_POLL_MS`
pub fn signal_poll_interval() -> Duration {
    Duration::from_millis(get_timeout_from_env("DISPLAY_LATENCY_SIGNAL_POLL_MS", SIGNAL_POLL_MS))
}
