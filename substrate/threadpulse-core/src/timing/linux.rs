//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Linux CPU timing via clock_gettime
#![allow(unsafe_code)] // clock_gettime requires unsafe

use libc::{clock_gettime, clockid_t, timespec, CLOCK_PROCESS_CPUTIME_ID, CLOCK_THREAD_CPUTIME_ID};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{median_of_sorted, Calibratable, CpuTimer, TimingError};

// Linux timer implementation
#[derive(Debug)]
pub struct LinuxTimer {
    // Calibrated overhead (ns)
    overhead_ns: AtomicU64,
}

impl LinuxTimer {
    // Create Linux timer
    pub fn new() -> Result<Self, TimingError> {
        let timer = Self {
            overhead_ns: AtomicU64::new(0),
        };

        // Verify both clocks
        read_clock(CLOCK_THREAD_CPUTIME_ID)?;
        read_clock(CLOCK_PROCESS_CPUTIME_ID)?;

        Ok(timer)
    }

    #[inline]
    fn get_thread_cpu_time_raw(&self) -> Result<u64, TimingError> {
        read_clock(CLOCK_THREAD_CPUTIME_ID)
    }
}

#[inline]
fn read_clock(clock: clockid_t) -> Result<u64, TimingError> {
    let mut ts = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    // SAFETY: Valid timespec and clock ID
    let ret = unsafe { clock_gettime(clock, &mut ts) };

    if ret == 0 {
        let secs_ns = (ts.tv_sec as u64).saturating_mul(1_000_000_000);
        Ok(secs_ns.saturating_add(ts.tv_nsec as u64))
    } else {
        Err(TimingError::SystemCallFailed(std::io::Error::last_os_error()))
    }
}

impl CpuTimer for LinuxTimer {
    #[inline]
    fn thread_cpu_time_ns(&self) -> Result<u64, TimingError> {
        let raw_time = self.get_thread_cpu_time_raw()?;
        let overhead = self.overhead_ns.load(Ordering::Relaxed);

        Ok(raw_time.saturating_sub(overhead))
    }

    fn process_cpu_time_ns(&self) -> Result<u64, TimingError> {
        read_clock(CLOCK_PROCESS_CPUTIME_ID)
    }

    #[inline]
    fn calibrated_overhead_ns(&self) -> u64 {
        self.overhead_ns.load(Ordering::Relaxed)
    }

    fn platform_name(&self) -> &'static str {
        "Linux (clock_gettime)"
    }
}

impl Calibratable for LinuxTimer {
    fn calibrate(&mut self) -> Result<(), TimingError> {
        const SAMPLES: usize = 1000;
        let mut overheads = Vec::with_capacity(SAMPLES);

        // Warm up
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
