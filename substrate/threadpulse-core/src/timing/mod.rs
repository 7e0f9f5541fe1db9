//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Cross-platform CPU time measurement
//!
//! Supervised threads read their own CPU clock after each work invocation and
//! the accounting collector reads the process clock. Both go through the
//! [`CpuTimer`] trait so the platform details stay in one place.
//!
//! # Platform Support
//!
//! - **Linux**: `clock_gettime(CLOCK_THREAD_CPUTIME_ID / CLOCK_PROCESS_CPUTIME_ID)`
//! - **Windows**: `QueryThreadCycleTime` and `GetProcessTimes`
//! - **macOS**: `thread_info(THREAD_BASIC_INFO)` and `getrusage(RUSAGE_SELF)`
//! - **Fallback**: `std::time::Instant` (wall time, not CPU time)
//!
//! Thread clocks are only readable from the thread they describe, which is
//! why each supervised thread samples itself instead of being sampled by the
//! collector.
//!
//! # Example
//!
//! ```rust
//! use threadpulse_core::timing::create_cpu_timer;
//!
//! let timer = create_cpu_timer();
//! let start = timer.thread_cpu_time_ns().unwrap();
//!
//! let mut sum = 0u64;
//! for i in 0..1000 {
//!     sum = sum.wrapping_add(i);
//! }
//! std::hint::black_box(sum);
//!
//! let end = timer.thread_cpu_time_ns().unwrap();
//! println!("CPU time used: {} ns", end.saturating_sub(start));
//! ```

use std::fmt;
use thiserror::Error;

mod fallback;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "windows")]
mod windows;

use fallback::FallbackTimer;
#[cfg(target_os = "linux")]
use linux::LinuxTimer;
#[cfg(target_os = "macos")]
use macos::MacOsTimer;
#[cfg(target_os = "windows")]
use windows::WindowsTimer;

/// Errors that can occur during CPU time measurement
#[derive(Debug, Error)]
pub enum TimingError {
    /// Platform is not supported for precise CPU timing
    #[error("Platform not supported: {0}")]
    PlatformNotSupported(String),

    /// System call failed
    #[error("System call failed: {0}")]
    SystemCallFailed(#[from] std::io::Error),

    /// Calibration failed
    #[error("Calibration failed: {0}")]
    CalibrationFailed(String),
}

/// CPU time source
///
/// Implementations are object-safe so the collector and the supervised
/// threads can hold a `Box<dyn CpuTimer>` without knowing the platform.
pub trait CpuTimer: Send + Sync {
    /// CPU time consumed by the calling thread, in nanoseconds
    ///
    /// Monotonic within a thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform call fails.
    fn thread_cpu_time_ns(&self) -> Result<u64, TimingError>;

    /// CPU time consumed by the whole process (all threads), in nanoseconds
    ///
    /// # Errors
    ///
    /// Returns an error if the platform call fails.
    fn process_cpu_time_ns(&self) -> Result<u64, TimingError>;

    /// Calibrated overhead of one thread measurement in nanoseconds
    fn calibrated_overhead_ns(&self) -> u64;

    /// Name of the platform implementation
    fn platform_name(&self) -> &'static str;

    /// `false` when the timer falls back to wall-clock time
    fn measures_cpu_time(&self) -> bool {
        true
    }
}

/// Timers that can measure and compensate their own overhead
pub trait Calibratable {
    /// Measure and store the median overhead of a thread measurement
    ///
    /// # Errors
    ///
    /// Returns an error if calibration fails due to system call errors.
    fn calibrate(&mut self) -> Result<(), TimingError>;

    /// Median overhead of a thread measurement over a short sample
    fn measure_overhead(&self) -> u64;
}

/// Creates the most accurate CPU timer available on this platform
///
/// Falls back to [`FallbackTimer`] when the native timer cannot be created.
#[must_use]
pub fn create_cpu_timer() -> Box<dyn CpuTimer> {
    #[cfg(target_os = "linux")]
    {
        match LinuxTimer::new() {
            Ok(mut timer) => {
                let _ = timer.calibrate(); // Uncalibrated is still usable
                Box::new(timer)
            },
            Err(_) => Box::new(FallbackTimer::new()),
        }
    }

    #[cfg(target_os = "windows")]
    {
        match WindowsTimer::new() {
            Ok(mut timer) => {
                let _ = timer.calibrate();
                Box::new(timer)
            },
            Err(_) => Box::new(FallbackTimer::new()),
        }
    }

    #[cfg(target_os = "macos")]
    {
        match MacOsTimer::new() {
            Ok(mut timer) => {
                let _ = timer.calibrate();
                Box::new(timer)
            },
            Err(_) => Box::new(FallbackTimer::new()),
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        Box::new(FallbackTimer::new())
    }
}

/// Describes a timer for diagnostics
#[derive(Debug, Clone)]
pub struct TimerInfo {
    /// Platform name
    pub platform: String,
    /// Calibrated overhead in nanoseconds
    pub overhead_ns: u64,
    /// Whether this measures actual CPU time or wall time
    pub measures_cpu_time: bool,
}

impl TimerInfo {
    /// Collects the description of `timer`
    pub fn of(timer: &dyn CpuTimer) -> Self {
        Self {
            platform: timer.platform_name().to_string(),
            overhead_ns: timer.calibrated_overhead_ns(),
            measures_cpu_time: timer.measures_cpu_time(),
        }
    }
}

impl fmt::Display for TimerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timer[{}: overhead={}ns, cpu_time={}]",
            self.platform, self.overhead_ns, self.measures_cpu_time
        )
    }
}

/// Calculates the median of a sorted slice
fn median_of_sorted(values: &[u64]) -> u64 {
    let len = values.len();
    if len == 0 {
        return 0;
    }

    if len % 2 == 0 {
        (values[len / 2 - 1] + values[len / 2]) / 2
    } else {
        values[len / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_timer() {
        let timer = create_cpu_timer();

        assert!(!timer.platform_name().is_empty());
        assert!(timer.thread_cpu_time_ns().is_ok());
        assert!(timer.process_cpu_time_ns().is_ok());
    }

    #[test]
    fn test_process_time_covers_thread_time() {
        let timer = create_cpu_timer();
        if !timer.measures_cpu_time() {
            return;
        }

        let mut sum = 0u64;
        for i in 0..200_000 {
            sum = sum.wrapping_add(i);
        }
        std::hint::black_box(sum);

        let thread = timer.thread_cpu_time_ns().unwrap();
        let process = timer.process_cpu_time_ns().unwrap();
        // Process clock includes this thread; allow for overhead compensation
        assert!(process + timer.calibrated_overhead_ns() + 1_000_000 >= thread);
    }

    #[test]
    fn test_timer_monotonicity() {
        let timer = create_cpu_timer();

        let mut previous = timer.thread_cpu_time_ns().unwrap();
        for _ in 0..100 {
            let mut sum = 0u64;
            for i in 0..1000 {
                sum = sum.wrapping_add(i);
            }
            std::hint::black_box(sum);

            let current = timer.thread_cpu_time_ns().unwrap();
            assert!(current >= previous, "Time went backwards: {} < {}", current, previous);
            previous = current;
        }
    }

    #[test]
    fn test_timer_info_display() {
        let timer = create_cpu_timer();
        let info = TimerInfo::of(timer.as_ref());
        assert!(info.to_string().starts_with("Timer["));
    }

    #[test]
    fn test_median_calculation() {
        assert_eq!(median_of_sorted(&[]), 0);
        assert_eq!(median_of_sorted(&[5]), 5);
        assert_eq!(median_of_sorted(&[1, 2]), 1);
        assert_eq!(median_of_sorted(&[1, 2, 3]), 2);
        assert_eq!(median_of_sorted(&[1, 2, 3, 4]), 2);
    }
}
