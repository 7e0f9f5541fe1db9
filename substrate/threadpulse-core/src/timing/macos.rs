//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// macOS CPU time via thread_info and getrusage
#![allow(unsafe_code)] /* Mach kernel APIs require unsafe */

use libc::{getrusage, rusage, thread_basic_info, thread_info, thread_info_t, timeval, RUSAGE_SELF};
use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_port::mach_port_deallocate;
use mach2::message::mach_msg_type_number_t;
use mach2::port::mach_port_t;
use mach2::traps::mach_task_self;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

const THREAD_BASIC_INFO: u32 = 3;
#[allow(clippy::cast_possible_truncation)]
const THREAD_BASIC_INFO_COUNT: mach_msg_type_number_t = (std::mem::size_of::<thread_basic_info>()
    / std::mem::size_of::<u32>())
    as mach_msg_type_number_t;

use super::{median_of_sorted, Calibratable, CpuTimer, TimingError};

/// macOS CPU timer
#[derive(Debug)]
pub struct MacOsTimer {
    /// Calibrated overhead in nanoseconds
    overhead_ns: AtomicU64,
}

impl MacOsTimer {
    /// Creates a new macOS timer
    ///
    /// # Errors
    ///
    /// Returns an error if `thread_info` or `getrusage` fails.
    pub fn new() -> Result<Self, TimingError> {
        let timer = Self {
            overhead_ns: AtomicU64::new(0),
        };

        timer.get_thread_cpu_time_raw()?;
        timer.process_cpu_time_ns()?;

        Ok(timer)
    }

    #[inline]
    #[allow(clippy::unused_self)]
    fn get_thread_cpu_time_raw(&self) -> Result<u64, TimingError> {
        let mut info = MaybeUninit::<thread_basic_info>::uninit();
        let mut count = THREAD_BASIC_INFO_COUNT;

        // SAFETY: mach_thread_self returns a send right we release below
        let thread: mach_port_t = unsafe { mach2::mach_init::mach_thread_self() };

        // SAFETY: properly sized buffer and matching count
        let kr = unsafe {
            thread_info(thread, THREAD_BASIC_INFO, info.as_mut_ptr() as thread_info_t, &mut count)
        };

        // SAFETY: releasing the right acquired above
        unsafe {
            mach_port_deallocate(mach_task_self(), thread);
        }

        if kr != KERN_SUCCESS {
            return Err(TimingError::SystemCallFailed(std::io::Error::other(format!(
                "thread_info failed with kern_return: {kr}"
            ))));
        }

        // SAFETY: thread_info has initialized the structure
        let info = unsafe { info.assume_init() };

        #[allow(clippy::cast_sign_loss)]
        let user_ns = (info.user_time.seconds as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add((info.user_time.microseconds as u64).saturating_mul(1_000));

        #[allow(clippy::cast_sign_loss)]
        let system_ns = (info.system_time.seconds as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add((info.system_time.microseconds as u64).saturating_mul(1_000));

        Ok(user_ns.saturating_add(system_ns))
    }
}

#[allow(clippy::cast_sign_loss)]
fn timeval_to_ns(time: &timeval) -> u64 {
    (time.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add((time.tv_usec as u64).saturating_mul(1_000))
}

impl CpuTimer for MacOsTimer {
    #[inline]
    fn thread_cpu_time_ns(&self) -> Result<u64, TimingError> {
        let raw_time = self.get_thread_cpu_time_raw()?;
        let overhead = self.overhead_ns.load(Ordering::Relaxed);

        Ok(raw_time.saturating_sub(overhead))
    }

    fn process_cpu_time_ns(&self) -> Result<u64, TimingError> {
        let mut usage = MaybeUninit::<rusage>::uninit();

        // SAFETY: valid out pointer for RUSAGE_SELF
        let ret = unsafe { getrusage(RUSAGE_SELF, usage.as_mut_ptr()) };
        if ret != 0 {
            return Err(TimingError::SystemCallFailed(std::io::Error::last_os_error()));
        }

        // SAFETY: getrusage succeeded and filled the structure
        let usage = unsafe { usage.assume_init() };
        Ok(timeval_to_ns(&usage.ru_utime).saturating_add(timeval_to_ns(&usage.ru_stime)))
    }

    #[inline]
    fn calibrated_overhead_ns(&self) -> u64 {
        self.overhead_ns.load(Ordering::Relaxed)
    }

    fn platform_name(&self) -> &'static str {
        "macOS (thread_info)"
    }
}

impl Calibratable for MacOsTimer {
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
    fn test_macos_timer_creation() {
        let result = MacOsTimer::new();
        assert!(result.is_ok(), "Failed to create macOS timer: {:?}", result);
    }

    #[test]
    fn test_macos_timer_measurement() {
        let timer = MacOsTimer::new().expect("Failed to create timer");

        let time1 = timer.thread_cpu_time_ns().expect("Failed to get time");

        let mut sum = 0u64;
        for i in 0..100000 {
            sum = sum.wrapping_add(i);
        }
        std::hint::black_box(sum);

        // Microsecond resolution, small changes may not show
        let time2 = timer.thread_cpu_time_ns().expect("Failed to get time");
        assert!(time2 >= time1, "Time went backwards: {} < {}", time2, time1);
    }

    #[test]
    fn test_process_usage_readable() {
        let timer = MacOsTimer::new().expect("Failed to create timer");
        assert!(timer.process_cpu_time_ns().is_ok());
    }

    #[test]
    fn test_calibration() {
        let mut timer = MacOsTimer::new().expect("Failed to create timer");
        assert_eq!(timer.calibrated_overhead_ns(), 0);

        timer.calibrate().expect("Calibration failed");

        // thread_info can be slow on CI machines
        let overhead = timer.calibrated_overhead_ns();
        assert!(overhead < 10000, "Overhead too high: {} ns", overhead);
    }
}
