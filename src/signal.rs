//! Named signals shared between the renderer and the measurer
//!
//! A measurement is a handshake between two parties: the measurer asks the
//! renderer to start drawing, the renderer reports when it stopped drawing and
//! when its rendered frames are on disk. Each step is a named, auto-resetting
//! signal: a successful [`NamedSignal::wait`] consumes it.
//!
//! [`FileSignal`] works across processes through marker files in a shared
//! directory. [`LocalSignal`] is the in-process equivalent.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::error::LatencyResult;

/// Set by the measurer once capture is running
pub const START_RENDER: &str = "start-render";

/// Set by the renderer when it stops drawing
pub const STOP_RENDER: &str = "stop-render";

/// Set by the renderer once its frames are saved
pub const IMAGE_SAVED: &str = "image-saved";

/// Granularity of [`FileSignal`] polling
const FILE_POLL_STEP: Duration = Duration::from_millis(10);

/// Auto-resetting named event
pub trait NamedSignal: Send + Sync {
    fn name(&self) -> &str;

    /// Raises the signal; raising an already raised signal is a no-op
    fn set(&self) -> LatencyResult<()>;

    /// Waits up to `timeout` for the signal and consumes it
    ///
    /// Returns `false` if the timeout elapsed first.
    fn wait(&self, timeout: Duration) -> LatencyResult<bool>;

    /// Clears the signal without waiting
    fn reset(&self) -> LatencyResult<()>;
}

/// Signal backed by a marker file `<dir>/<name>.signal`
#[derive(Debug, Clone)]
pub struct FileSignal {
    name: String,
    path: PathBuf,
}

impl FileSignal {
    /// Creates a signal in `dir`, creating the directory if necessary
    pub fn new(dir: impl AsRef<Path>, name: impl Into<String>) -> LatencyResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let name = name.into();
        let path = dir.join(format!("{name}.signal"));
        Ok(Self { name, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consumes the marker if present
    fn take(&self) -> LatencyResult<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl NamedSignal for FileSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn set(&self) -> LatencyResult<()> {
        // Write then rename so a waiter never sees a half-created marker.
        let staging = self.path.with_extension(format!("signal.{}", std::process::id()));
        fs::write(&staging, b"")?;
        fs::rename(&staging, &self.path)?;
        debug!(signal = %self.name, "Signal set");
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> LatencyResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.take()? {
                debug!(signal = %self.name, "Signal observed");
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(FILE_POLL_STEP.min(deadline - now));
        }
    }

    fn reset(&self) -> LatencyResult<()> {
        self.take()?;
        Ok(())
    }
}

/// In-process signal built on a mutex and condition variable
#[derive(Debug)]
pub struct LocalSignal {
    name:   String,
    raised: Mutex<bool>,
    cond:   Condvar,
}

impl LocalSignal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name:   name.into(),
            raised: Mutex::new(false),
            cond:   Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        self.raised.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl NamedSignal for LocalSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn set(&self) -> LatencyResult<()> {
        *self.lock() = true;
        self.cond.notify_one();
        debug!(signal = %self.name, "Signal set");
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> LatencyResult<bool> {
        let guard = self.lock();
        let (mut guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |raised| !*raised)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let observed = std::mem::replace(&mut *guard, false);
        Ok(observed)
    }

    fn reset(&self) -> LatencyResult<()> {
        *self.lock() = false;
        Ok(())
    }
}

/// The three signals of a measurement handshake
#[derive(Clone)]
pub struct RenderSignals {
    pub start_render: Arc<dyn NamedSignal>,
    pub stop_render:  Arc<dyn NamedSignal>,
    pub image_saved:  Arc<dyn NamedSignal>,
}

impl RenderSignals {
    /// Marker-file signals in `dir`, usable across processes
    pub fn file_backed(dir: impl AsRef<Path>) -> LatencyResult<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            start_render: Arc::new(FileSignal::new(dir, START_RENDER)?),
            stop_render:  Arc::new(FileSignal::new(dir, STOP_RENDER)?),
            image_saved:  Arc::new(FileSignal::new(dir, IMAGE_SAVED)?),
        })
    }

    /// In-process signals, for a renderer running in the same process
    pub fn local() -> Self {
        Self {
            start_render: Arc::new(LocalSignal::new(START_RENDER)),
            stop_render:  Arc::new(LocalSignal::new(STOP_RENDER)),
            image_saved:  Arc::new(LocalSignal::new(IMAGE_SAVED)),
        }
    }

    /// Clears all three signals
    pub fn reset(&self) -> LatencyResult<()> {
        self.start_render.reset()?;
        self.stop_render.reset()?;
        self.image_saved.reset()
    }
}

impl std::fmt::Debug for RenderSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderSignals")
            .field("start_render", &self.start_render.name())
            .field("stop_render", &self.stop_render.name())
            .field("image_saved", &self.image_saved.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_file_signal_set_then_wait() {
        let dir = TempDir::new().unwrap();
        let signal = FileSignal::new(dir.path(), START_RENDER).unwrap();

        assert!(!signal.wait(Duration::from_millis(20)).unwrap());
        signal.set().unwrap();
        assert!(signal.path().exists());
        assert!(signal.wait(Duration::from_millis(20)).unwrap());
        // consumed by the first wait
        assert!(!signal.path().exists());
        assert!(!signal.wait(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn test_file_signal_across_handles() {
        let dir = TempDir::new().unwrap();
        let setter = FileSignal::new(dir.path(), IMAGE_SAVED).unwrap();
        let waiter = FileSignal::new(dir.path(), IMAGE_SAVED).unwrap();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            setter.set().unwrap();
        });
        assert!(waiter.wait(Duration::from_secs(5)).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_file_signal_reset() {
        let dir = TempDir::new().unwrap();
        let signal = FileSignal::new(dir.path(), STOP_RENDER).unwrap();
        signal.set().unwrap();
        signal.reset().unwrap();
        signal.reset().unwrap();
        assert!(!signal.wait(Duration::ZERO).unwrap());
    }

    #[test]
    fn test_local_signal_auto_resets() {
        let signal = LocalSignal::new("test");
        signal.set().unwrap();
        signal.set().unwrap();
        assert!(signal.wait(Duration::from_millis(10)).unwrap());
        assert!(!signal.wait(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_local_signal_wakes_waiter() {
        let signal = Arc::new(LocalSignal::new("test"));
        let setter = Arc::clone(&signal);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set().unwrap();
        });
        assert!(signal.wait(Duration::from_secs(5)).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_render_signals_names() {
        let dir = TempDir::new().unwrap();
        let signals = RenderSignals::file_backed(dir.path()).unwrap();
        assert_eq!(signals.start_render.name(), "start-render");
        assert_eq!(signals.stop_render.name(), "stop-render");
        assert_eq!(signals.image_saved.name(), "image-saved");

        signals.image_saved.set().unwrap();
        signals.reset().unwrap();
        assert!(!signals.image_saved.wait(Duration::ZERO).unwrap());
    }
}
