//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Fallback timer using std::time::Instant (wall time, not CPU time)
#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Once, OnceLock};
use std::time::Instant;

use super::{median_of_sorted, Calibratable, CpuTimer, TimingError};

// Shared origin so every fallback timer reports the same "process" clock
static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Fallback timer using `std::time::Instant`
///
/// WARNING: This measures wall time, not CPU time!
pub struct FallbackTimer {
    start_time: Instant,
    overhead_ns: AtomicU64,
    warned: Once,
}

impl FallbackTimer {
    /// Creates a new, calibrated fallback timer
    pub fn new() -> Self {
        PROCESS_EPOCH.get_or_init(Instant::now);

        let mut timer = Self {
            start_time: Instant::now(),
            overhead_ns: AtomicU64::new(0),
            warned: Once::new(),
        };
        let _ = timer.calibrate(); // Cannot fail for Instant
        timer
    }

    fn warn_once(&self) {
        self.warned.call_once(|| {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Using fallback timer with Instant::now(). \
                This measures wall time, not CPU time, so CPU shares will be overstated."
            );

            #[cfg(not(feature = "tracing"))]
            eprintln!(
                "WARNING: Using fallback timer with Instant::now(). \
                This measures wall time, not CPU time."
            );
        });
    }

    #[inline]
    fn get_time_raw(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        let nanos = self.start_time.elapsed().as_nanos() as u64;
        nanos
    }
}

impl CpuTimer for FallbackTimer {
    #[inline]
    fn thread_cpu_time_ns(&self) -> Result<u64, TimingError> {
        self.warn_once();

        let raw_time = self.get_time_raw();
        let overhead = self.overhead_ns.load(Ordering::Relaxed);

        Ok(raw_time.saturating_sub(overhead))
    }

    fn process_cpu_time_ns(&self) -> Result<u64, TimingError> {
        self.warn_once();

        let epoch = PROCESS_EPOCH.get_or_init(Instant::now);
        #[allow(clippy::cast_possible_truncation)]
        let nanos = epoch.elapsed().as_nanos() as u64;
        Ok(nanos)
    }

    #[inline]
    fn calibrated_overhead_ns(&self) -> u64 {
        self.overhead_ns.load(Ordering::Relaxed)
    }

    fn platform_name(&self) -> &'static str {
        "Fallback (Instant::now - WARNING: measures wall time, not CPU time)"
    }

    fn measures_cpu_time(&self) -> bool {
        false
    }
}

impl Calibratable for FallbackTimer {
    fn calibrate(&mut self) -> Result<(), TimingError> {
        const SAMPLES: usize = 1000;
        let mut overheads = Vec::with_capacity(SAMPLES);

        for _ in 0..100 {
            let _ = self.get_time_raw();
        }

        for _ in 0..SAMPLES {
            let start = self.get_time_raw();
            let end = self.get_time_raw();
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
            let start = self.get_time_raw();
            let end = self.get_time_raw();
            overheads.push(end.saturating_sub(start));
        }

        overheads.sort_unstable();
        median_of_sorted(&overheads)
    }
}

impl Default for FallbackTimer {
    fn default() -> Self {
        Self::new()
    }
}
