//! Monotonic tick clock shared by the renderer and the capture pipeline
//!
//! Latency is the difference between two ticks taken in different places, so
//! both sides must read the same counter. On Windows this is the
//! QueryPerformanceCounter, which is system-wide. Elsewhere ticks are
//! nanoseconds since a process-wide epoch.

use std::sync::atomic::{AtomicI64, Ordering};

/// Source of monotonic timestamps
pub trait Clock: Send + Sync {
    /// Current tick count
    fn now(&self) -> i64;

    /// Number of ticks in one second
    fn ticks_per_second(&self) -> i64;
}

/// High-resolution system counter
#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceCounter;

#[cfg(all(target_os = "windows", feature = "dxgi-backend"))]
impl Clock for PerformanceCounter {
    fn now(&self) -> i64 {
        let mut ticks = 0i64;
        // QueryPerformanceCounter cannot fail on Windows XP and later.
        let _ = unsafe { windows::Win32::System::Performance::QueryPerformanceCounter(&mut ticks) };
        ticks
    }

    fn ticks_per_second(&self) -> i64 {
        let mut frequency = 0i64;
        let _ = unsafe {
            windows::Win32::System::Performance::QueryPerformanceFrequency(&mut frequency)
        };
        frequency
    }
}

#[cfg(not(all(target_os = "windows", feature = "dxgi-backend")))]
impl Clock for PerformanceCounter {
    fn now(&self) -> i64 {
        static EPOCH: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
        let epoch = EPOCH.get_or_init(std::time::Instant::now);
        i64::try_from(epoch.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }

    fn ticks_per_second(&self) -> i64 {
        1_000_000_000
    }
}

/// Deterministic clock that advances by a fixed step on every read
///
/// Used by the mock backend and tests to get reproducible, strictly
/// increasing timestamps.
#[derive(Debug)]
pub struct SteppingClock {
    next:             AtomicI64,
    step:             i64,
    ticks_per_second: i64,
}

impl SteppingClock {
    /// Creates a clock starting at `start` that advances by `step` per read
    pub fn new(start: i64, step: i64, ticks_per_second: i64) -> Self {
        Self {
            next: AtomicI64::new(start),
            step,
            ticks_per_second,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> i64 {
        self.next.fetch_add(self.step, Ordering::SeqCst)
    }

    fn ticks_per_second(&self) -> i64 {
        self.ticks_per_second
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_performance_counter_is_monotonic() {
        let clock = PerformanceCounter;
        let mut previous = clock.now();
        for _ in 0..1000 {
            let current = clock.now();
            assert!(current >= previous);
            previous = current;
        }
        assert!(clock.ticks_per_second() > 0);
    }

    #[test]
    fn test_stepping_clock() {
        let clock = SteppingClock::new(100, 5, 1000);
        assert_eq!(clock.now(), 100);
        assert_eq!(clock.now(), 105);
        assert_eq!(clock.now(), 110);
        assert_eq!(clock.ticks_per_second(), 1000);
    }
}
