//! Latency estimation from rendered and captured frame sequences

pub mod estimator;
pub mod matcher;

pub use estimator::{EstimatorConfig, LatencyEstimator};
pub use matcher::{ImageMatcher, NccMatcher};
