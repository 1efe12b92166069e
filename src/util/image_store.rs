//! On-disk storage of timestamped frames
//!
//! The renderer and the measurer exchange frame sequences through a shared
//! directory. Every frame is one PNG file named `{timestamp}{suffix}`, so the
//! timestamp survives the round trip without a side-car index and renderer
//! and capture images can share one directory.
//!
//! # Examples
//!
//! ```
//! use display_latency::{
//!     model::TimestampedFrame,
//!     util::image_store::{ImageStore, RENDER_IMAGE_SUFFIX},
//! };
//! use image::RgbaImage;
//!
//! let parent = std::env::temp_dir();
//! let store = ImageStore::create_unique(&parent).unwrap().with_cleanup(true);
//!
//! let frames = vec![TimestampedFrame::new(42, RgbaImage::new(4, 4))];
//! store.save(&frames, RENDER_IMAGE_SUFFIX).unwrap();
//!
//! let loaded = store.load(RENDER_IMAGE_SUFFIX).unwrap();
//! assert_eq!(loaded[0].timestamp, 42);
//! // The directory is removed when `store` is dropped
//! ```

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{SecondsFormat, Utc};
use image::ImageFormat;
use tracing::{debug, warn};

use crate::{error::LatencyResult, model::TimestampedFrame};

/// Suffix of frames saved by the renderer
pub const RENDER_IMAGE_SUFFIX: &str = ".render.png";

/// Suffix of frames saved by the capture side
pub const CAPTURE_IMAGE_SUFFIX: &str = ".capture.png";

/// Directory of timestamped PNG frames
///
/// Directories are kept on drop. A store marked with
/// [`with_cleanup`](ImageStore::with_cleanup) deletes its directory when
/// dropped instead; cleanup is best-effort and only logs errors.
#[derive(Debug)]
pub struct ImageStore {
    root:            PathBuf,
    cleanup_on_drop: bool,
}

impl ImageStore {
    /// Opens `dir` as a store, creating it if necessary
    ///
    /// The directory is kept when the store is dropped.
    pub fn open(dir: impl AsRef<Path>) -> LatencyResult<Self> {
        let root = dir.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            cleanup_on_drop: false,
        })
    }

    /// Creates a fresh, uniquely named directory under `parent`
    ///
    /// The directory name is `latency-{timestamp}-{pid}` where timestamp is
    /// an RFC 3339 string with special characters replaced for filesystem
    /// compatibility. Like [`open`](ImageStore::open), the directory is kept
    /// on drop unless [`with_cleanup`](ImageStore::with_cleanup) is set.
    pub fn create_unique(parent: impl AsRef<Path>) -> LatencyResult<Self> {
        let parent = parent.as_ref();
        fs::create_dir_all(parent)?;

        let timestamp: String = Utc::now()
            .to_rfc3339_opts(SecondsFormat::Micros, true)
            .chars()
            .map(|c| match c {
                ':' => '-',
                '+' | '.' => '_',
                _ => c,
            })
            .collect();
        let base = format!("latency-{}-{}", timestamp, std::process::id());

        let mut attempt = 0u32;
        loop {
            let name = match attempt {
                0 => base.clone(),
                n => format!("{base}-{n}"),
            };
            let root = parent.join(name);
            match fs::create_dir(&root) {
                Ok(()) => {
                    debug!(path = %root.display(), "Created image store");
                    return Ok(Self {
                        root,
                        cleanup_on_drop: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Sets whether the directory is deleted on drop
    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup_on_drop = cleanup;
        self
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Path a frame with `timestamp` is stored under
    pub fn frame_path(&self, timestamp: i64, suffix: &str) -> PathBuf {
        self.root.join(format!("{timestamp}{suffix}"))
    }

    /// Writes frames as PNG files, returning how many were written
    ///
    /// Frames without pixels are skipped.
    pub fn save(&self, frames: &[TimestampedFrame], suffix: &str) -> LatencyResult<usize> {
        let mut written = 0;
        for frame in frames {
            let Some(pixels) = frame.pixels.as_ref() else {
                debug!(timestamp = frame.timestamp, "Skipping frame without pixels");
                continue;
            };
            pixels.save_with_format(self.frame_path(frame.timestamp, suffix), ImageFormat::Png)?;
            written += 1;
        }
        debug!(written, suffix, path = %self.root.display(), "Saved frames");
        Ok(written)
    }

    /// Reads every `{timestamp}{suffix}` file, sorted by timestamp
    ///
    /// Files whose name does not start with an integer timestamp are ignored.
    pub fn load(&self, suffix: &str) -> LatencyResult<Vec<TimestampedFrame>> {
        let mut frames = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(suffix) else {
                continue;
            };
            let Ok(timestamp) = stem.parse::<i64>() else {
                warn!(file = name, "Ignoring frame file without a timestamp");
                continue;
            };

            let pixels = image::open(&path)?.to_rgba8();
            frames.push(TimestampedFrame::new(timestamp, pixels));
        }

        frames.sort_by_key(|frame| frame.timestamp);
        debug!(count = frames.len(), suffix, "Loaded frames");
        Ok(frames)
    }

    /// Deletes the directory and everything in it
    pub fn remove(mut self) -> LatencyResult<()> {
        self.cleanup_on_drop = false;
        fs::remove_dir_all(&self.root)?;
        Ok(())
    }
}

impl Drop for ImageStore {
    fn drop(&mut self) {
        if self.cleanup_on_drop && self.root.exists() {
            if let Err(e) = fs::remove_dir_all(&self.root) {
                warn!("Failed to remove image store {:?}: {}", self.root, e);
            }
        }
    }
}
