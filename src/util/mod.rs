//! Utility modules for display-latency
//!
//! - `image_store`: on-disk exchange of timestamped frames

pub mod image_store;
