//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Windows CPU time via QueryThreadCycleTime and GetProcessTimes
#![allow(unsafe_code)] /* Windows APIs require unsafe */

use std::sync::atomic::{AtomicU64, Ordering};
use windows_sys::Win32::Foundation::FILETIME;
use windows_sys::Win32::System::{
    Performance::QueryPerformanceFrequency,
    Threading::{GetCurrentProcess, GetCurrentThread, GetProcessTimes, QueryThreadCycleTime},
};

use super::{median_of_sorted, Calibratable, CpuTimer, TimingError};

/// Windows CPU timer
#[derive(Debug)]
pub struct WindowsTimer {
    /// Frequency for cycle-to-time conversion
    frequency: u64,
    /// Calibrated overhead in nanoseconds
    overhead_ns: AtomicU64,
}

impl WindowsTimer {
    /// Creates a new Windows timer
    ///
    /// # Errors
    ///
    /// Returns an error if QueryPerformanceFrequency or QueryThreadCycleTime fails.
    pub fn new() -> Result<Self, TimingError> {
        let frequency = Self::get_performance_frequency()?;
        if frequency == 0 {
            return Err(TimingError::PlatformNotSupported(
                "QueryPerformanceFrequency reported zero".to_string(),
            ));
        }

        let timer = Self {
            frequency,
            overhead_ns: AtomicU64::new(0),
        };

        timer.get_thread_cycles()?;
        timer.process_cpu_time_ns()?;

        Ok(timer)
    }

    fn get_performance_frequency() -> Result<u64, TimingError> {
        let mut frequency = 0i64;

        // SAFETY: valid out pointer
        let ret = unsafe { QueryPerformanceFrequency(&mut frequency) };

        if ret != 0 {
            Ok(frequency as u64)
        } else {
            Err(TimingError::SystemCallFailed(std::io::Error::last_os_error()))
        }
    }

    #[inline]
    fn get_thread_cycles(&self) -> Result<u64, TimingError> {
        let mut cycles = 0u64;

        // SAFETY: GetCurrentThread returns a pseudo-handle that doesn't need to be closed.
        let ret = unsafe { QueryThreadCycleTime(GetCurrentThread(), &mut cycles) };

        if ret != 0 {
            Ok(cycles)
        } else {
            Err(TimingError::SystemCallFailed(std::io::Error::last_os_error()))
        }
    }

    #[inline]
    fn cycles_to_nanoseconds(&self, cycles: u64) -> u64 {
        cycles.saturating_mul(1_000_000_000).saturating_div(self.frequency)
    }

    #[inline]
    fn get_thread_cpu_time_raw(&self) -> Result<u64, TimingError> {
        let cycles = self.get_thread_cycles()?;
        Ok(self.cycles_to_nanoseconds(cycles))
    }
}

// FILETIME counts 100ns intervals
fn filetime_to_ns(time: &FILETIME) -> u64 {
    let ticks = (u64::from(time.dwHighDateTime) << 32) | u64::from(time.dwLowDateTime);
    ticks.saturating_mul(100)
}

impl CpuTimer for WindowsTimer {
    #[inline]
    fn thread_cpu_time_ns(&self) -> Result<u64, TimingError> {
        let raw_time = self.get_thread_cpu_time_raw()?;
        let overhead = self.overhead_ns.load(Ordering::Relaxed);

        Ok(raw_time.saturating_sub(overhead))
    }

    fn process_cpu_time_ns(&self) -> Result<u64, TimingError> {
        let empty = FILETIME {
            dwLowDateTime: 0,
            dwHighDateTime: 0,
        };
        let (mut creation, mut exit, mut kernel, mut user) = (empty, empty, empty, empty);

        // SAFETY: pseudo-handle for the current process and valid out pointers
        let ret = unsafe {
            GetProcessTimes(GetCurrentProcess(), &mut creation, &mut exit, &mut kernel, &mut user)
        };

        if ret != 0 {
            Ok(filetime_to_ns(&kernel).saturating_add(filetime_to_ns(&user)))
        } else {
            Err(TimingError::SystemCallFailed(std::io::Error::last_os_error()))
        }
    }

    #[inline]
    fn calibrated_overhead_ns(&self) -> u64 {
        self.overhead_ns.load(Ordering::Relaxed)
    }

    fn platform_name(&self) -> &'static str {
        "Windows (QueryThreadCycleTime)"
    }
}

impl Calibratable for WindowsTimer {
    fn calibrate(&mut self) -> Result<(), TimingError> {
        const SAMPLES: usize = 1000;
        let mut overheads = Vec::with_capacity(SAMPLES);

        for _ in 0..100 {
            let _ = self.get_thread_cpu_time_raw();
        }

        for _ in 0..SAMPLES {
            let start = self.get_thread_cpu_time_raw()?;
            let end = self.get_thread_cpu_time_raw()?;
            overheads.push(end.saturating_sub(start));
        }

        overheads.sort_unstable();
        self.overhead_ns.store(median_of_sorted(&overheads), Ordering::Relaxed);

        Ok(())
    }

    fn measure_overhead(&self) -> u64 {
        const SAMPLES: usize = 100;
        let mut overheads = Vec::with_capacity(SAMPLES);

        for _ in 0..SAMPLES {
            if let (Ok(start), Ok(end)) =
                (self.get_thread_cpu_time_raw(), self.get_thread_cpu_time_raw())
            {
                overheads.push(end.saturating_sub(start));
            }
        }

        if overheads.is_empty() {
            return 0;
        }

        overheads.sort_unstable();
        median_of_sorted(&overheads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_timer_creation() {
        let result = WindowsTimer::new();
        assert!(result.is_ok(), "Failed to create Windows timer: {:?}", result);
    }

    #[test]
    fn test_filetime_conversion() {
        let time = FILETIME {
            dwLowDateTime: 10,
            dwHighDateTime: 0,
        };
        assert_eq!(filetime_to_ns(&time), 1_000);
    }

    #[test]
    fn test_process_times() {
        let timer = WindowsTimer::new().expect("Failed to create timer");
        assert!(timer.process_cpu_time_ns().is_ok());
    }

    #[test]
    fn test_monotonicity() {
        let timer = WindowsTimer::new().expect("Failed to create timer");

        let mut previous = timer.thread_cpu_time_ns().expect("Failed to get time");
        for _ in 0..1000 {
            let current = timer.thread_cpu_time_ns().expect("Failed to get time");
            assert!(current >= previous, "Time went backwards: {} < {}", current, previous);
            previous = current;
        }
    }
}
