//! Error types for display latency measurement
//!
//! This module defines the error taxonomy shared by the capture pipeline,
//! the image matcher, and the measurement flow. Each error provides context
//! about what went wrong and a remediation hint suggesting next steps.

use crate::model::{BackendType, CaptureRegion};

/// Result type alias for latency measurement operations
pub type LatencyResult<T> = Result<T, LatencyError>;

/// Error type for capture, matching, and measurement operations
///
/// Each variant includes detailed context and provides remediation hints
/// through the `remediation_hint()` method.
#[derive(Debug, thiserror::Error)]
pub enum LatencyError {
    /// Capture region cannot be captured from the current desktop
    #[error("Invalid capture region {region}: {reason}")]
    InvalidRegion {
        /// The region as requested by the caller
        region: CaptureRegion,
        /// Why the region was rejected
        reason: String,
    },

    /// Neither image fits inside the other
    #[error(
        "Incompatible image sizes for matching: {first_width}x{first_height} vs \
         {second_width}x{second_height}"
    )]
    IncompatibleSizes {
        first_width:   u32,
        first_height:  u32,
        second_width:  u32,
        second_height: u32,
    },

    /// Frame source failed for a reason other than a timeout
    #[error("Frame acquisition failed: {reason}")]
    AcquisitionFailure {
        /// Description of the underlying failure
        reason: String,
    },

    /// Requested backend is not available
    #[error("Backend {backend} is not available on this platform")]
    BackendNotAvailable {
        /// Backend type that's unavailable
        backend: BackendType,
    },

    /// Invalid parameter provided
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Name of the invalid parameter
        parameter: String,
        /// Reason why it's invalid
        reason:    String,
    },

    /// Waiting on a signal or stage exceeded its deadline
    #[error("Timed out after {duration_ms}ms waiting for {what}")]
    Timeout {
        /// What was being waited on
        what:        String,
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// A worker thread or task panicked
    #[error("Worker '{worker}' panicked")]
    WorkerPanicked {
        /// Name of the worker
        worker: String,
    },

    /// I/O error occurred
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Image processing error
    #[error("Image processing error: {0}")]
    ImageError(String),
}

impl From<image::ImageError> for LatencyError {
    fn from(error: image::ImageError) -> Self {
        LatencyError::ImageError(error.to_string())
    }
}

impl LatencyError {
    /// Returns an actionable remediation hint for this error
    ///
    /// # Examples
    ///
    /// ```
    /// use display_latency::{error::LatencyError, model::CaptureRegion};
    ///
    /// let error = LatencyError::InvalidRegion {
    ///     region: CaptureRegion::new(-5, 0, 10, 10),
    ///     reason: "origin lies before the desktop origin".to_string(),
    /// };
    ///
    /// assert!(error.remediation_hint().contains("desktop"));
    /// ```
    pub fn remediation_hint(&self) -> &str {
        match self {
            LatencyError::InvalidRegion { .. } => {
                "Choose a region whose origin lies on the duplicated output and whose width and \
                 height are positive. Regions are given in desktop coordinates."
            }
            LatencyError::IncompatibleSizes { .. } => {
                "Rendered and captured frames must overlap in size. Capture a region at least as \
                 large as the rendered window contents."
            }
            LatencyError::AcquisitionFailure { .. } => {
                "The desktop duplication session was lost. This happens on mode changes, secure \
                 desktop switches, or when another process owns the output. Restart the capture."
            }
            LatencyError::BackendNotAvailable { backend } => match backend {
                BackendType::Dxgi => {
                    "DXGI Desktop Duplication is only available on Windows builds with the \
                     dxgi-backend feature enabled."
                }
                BackendType::Mock => "The mock backend should always be available.",
            },
            LatencyError::InvalidParameter { parameter, .. } => match parameter.as_str() {
                "threshold" => "Threshold must lie between -1.0 and 1.0.",
                "window" => "Window must be at least 1.",
                "ticks_per_second" => "Ticks per second must be a positive number.",
                "region" => "Regions are written as x,y,width,height.",
                _ => "Check the parameter value against the command help.",
            },
            LatencyError::Timeout { .. } => {
                "The renderer did not respond in time. Ensure the renderer is running, shares \
                 the same signal directory, and raise DISPLAY_LATENCY_MEASURE_TIMEOUT_SECS if \
                 needed."
            }
            LatencyError::WorkerPanicked { .. } => {
                "A background worker crashed. Rerun with RUST_LOG=display_latency=debug for \
                 details."
            }
            LatencyError::IoError(_) => {
                "An I/O error occurred. Check file permissions, disk space, and system resources."
            }
            LatencyError::ImageError(_) => {
                "Image processing failed. Ensure stored frames are valid PNG files and the \
                 requested operations are supported."
            }
        }
    }
}
