//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! CPU accounting for supervised threads
//!
//! Supervised threads record their own CPU clock after every invocation. A
//! [`CpuUsageCollector`] periodically turns those readings into shares of the
//! process and of the machine, and raises a change notification when a
//! thread's share moves past its threshold. The collector runs as a
//! supervised thread itself through [`CollectorWorker`].
//!
//! System capacity over an interval is wall time multiplied by the logical
//! CPU count, so a thread saturating one core of a four-core machine reports
//! 25% system usage.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

#[cfg(feature = "tracing")]
use tracing::{debug, trace};

use crate::hooks::HookRegistry;
use crate::metrics::SubstrateMetrics;
use crate::supervisor::{ThreadManager, Worker, WorkerContext, WorkerError};
use crate::timing::{create_cpu_timer, CpuTimer, TimingError};

/// Default minimum spacing between process usage computations
pub const DEFAULT_MIN_SAMPLING_INTERVAL: Duration = Duration::from_millis(500);

/// Pluggable source of per-thread CPU shares
pub trait CpuUsageCollector: Send + Sync {
    /// Starts accounting for `manager`.
    fn thread_add(&self, manager: &Arc<ThreadManager>);

    /// Stops accounting for `manager`.
    fn thread_remove(&self, manager: &ThreadManager);

    /// Overall process CPU usage in percent of machine capacity.
    ///
    /// Implementations may return a cached value when called more often than
    /// their minimum sampling interval.
    fn get_process_usage(&self) -> f64;

    /// Distributes one accounting interval across the watched threads.
    ///
    /// # Errors
    ///
    /// Returns [`TimingError`] if the process clock cannot be read.
    fn sample(&self) -> Result<CpuSample, TimingError>;
}

/// Result of one [`CpuUsageCollector::sample`] pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSample {
    /// Process CPU time over the interval, in nanoseconds
    pub process_delta_ns: u64,
    /// Machine capacity over the interval, in nanoseconds
    pub system_delta_ns: u64,
    /// Process usage over the interval, in percent of machine capacity
    pub process_usage: f64,
    /// Threads accounted
    pub threads: usize,
    /// Threads whose share crossed their change threshold
    pub changed: usize,
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    at: Instant,
    process_ns: u64,
}

/// Collector backed by the platform process clock
pub struct ProcessCpuCollector {
    timer: Box<dyn CpuTimer>,
    watched: DashMap<u64, Arc<ThreadManager>>,
    logical_cpus: u32,
    min_sampling_interval: Duration,
    usage_baseline: Mutex<Baseline>,
    sample_baseline: Mutex<Baseline>,
    last_usage: AtomicU64,
    hooks: Arc<HookRegistry>,
    metrics: Arc<SubstrateMetrics>,
}

impl ProcessCpuCollector {
    /// Creates a collector using the platform timer.
    pub fn new(hooks: Arc<HookRegistry>, metrics: Arc<SubstrateMetrics>) -> Self {
        Self::with_timer(create_cpu_timer(), hooks, metrics)
    }

    /// Creates a collector over an explicit timer.
    pub fn with_timer(
        timer: Box<dyn CpuTimer>,
        hooks: Arc<HookRegistry>,
        metrics: Arc<SubstrateMetrics>,
    ) -> Self {
        let logical_cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let baseline = Baseline {
            at: Instant::now(),
            process_ns: timer.process_cpu_time_ns().unwrap_or(0),
        };

        #[cfg(feature = "tracing")]
        debug!(platform = timer.platform_name(), logical_cpus, "CPU collector created");

        Self {
            timer,
            watched: DashMap::new(),
            logical_cpus,
            min_sampling_interval: DEFAULT_MIN_SAMPLING_INTERVAL,
            usage_baseline: Mutex::new(baseline),
            sample_baseline: Mutex::new(baseline),
            last_usage: AtomicU64::new(0f64.to_bits()),
            hooks,
            metrics,
        }
    }

    /// Sets the minimum spacing between process usage computations.
    #[must_use]
    pub fn min_sampling_interval(mut self, interval: Duration) -> Self {
        self.min_sampling_interval = interval;
        self
    }

    /// Logical CPUs used to derive machine capacity.
    pub fn logical_cpus(&self) -> u32 {
        self.logical_cpus
    }

    /// Number of threads being accounted.
    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    /// Whether `id` is being accounted.
    pub fn is_watching(&self, id: u64) -> bool {
        self.watched.contains_key(&id)
    }

    /// Timer backing the collector.
    pub fn timer(&self) -> &dyn CpuTimer {
        self.timer.as_ref()
    }

    fn system_capacity_ns(&self, wall: Duration) -> u64 {
        let wall_ns = u64::try_from(wall.as_nanos()).unwrap_or(u64::MAX);
        wall_ns.saturating_mul(u64::from(self.logical_cpus))
    }

    // Advances `baseline` to now and returns (process delta, system delta)
    fn advance(&self, baseline: &mut Baseline) -> Result<(u64, u64), TimingError> {
        let now = Instant::now();
        let process_ns = self.timer.process_cpu_time_ns()?;

        let process_delta = process_ns.saturating_sub(baseline.process_ns);
        let system_delta = self.system_capacity_ns(now.saturating_duration_since(baseline.at));

        *baseline = Baseline { at: now, process_ns };
        Ok((process_delta, system_delta))
    }
}

/// `part` as a percentage of `total`, capped at 100; zero when `total` is zero
pub(crate) fn percent_of(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64 * 100.0).min(100.0)
    }
}

impl CpuUsageCollector for ProcessCpuCollector {
    fn thread_add(&self, manager: &Arc<ThreadManager>) {
        // Discard CPU time from before accounting started
        manager.take_cpu_delta();
        self.watched.insert(manager.id(), Arc::clone(manager));

        #[cfg(feature = "tracing")]
        trace!(id = manager.id(), name = ?manager.name(), "Thread added to CPU accounting");
    }

    fn thread_remove(&self, manager: &ThreadManager) {
        self.watched.remove(&manager.id());
    }

    fn get_process_usage(&self) -> f64 {
        let mut baseline = self.usage_baseline.lock();
        if baseline.at.elapsed() < self.min_sampling_interval {
            return f64::from_bits(self.last_usage.load(Ordering::Relaxed));
        }

        match self.advance(&mut baseline) {
            Ok((process_delta, system_delta)) => {
                let usage = percent_of(process_delta, system_delta);
                self.last_usage.store(usage.to_bits(), Ordering::Relaxed);
                usage
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                debug!(error = %_err, "Process CPU read failed, keeping last usage");
                f64::from_bits(self.last_usage.load(Ordering::Relaxed))
            }
        }
    }

    fn sample(&self) -> Result<CpuSample, TimingError> {
        let (process_delta, system_delta) = {
            let mut baseline = self.sample_baseline.lock();
            self.advance(&mut baseline)?
        };

        // Snapshot first so no shard lock is held while hooks run
        let watched: Vec<Arc<ThreadManager>> =
            self.watched.iter().map(|entry| Arc::clone(entry.value())).collect();

        let mut changed = 0;
        for manager in &watched {
            let thread_delta = manager.take_cpu_delta();
            if manager.update_thread_usage(process_delta, system_delta, thread_delta) {
                changed += 1;
                self.metrics.record_cpu_change();
                self.hooks.cpu_changed(
                    &manager.snapshot(),
                    manager.process_cpu_usage(),
                    manager.system_cpu_usage(),
                );
            }
        }

        let process_usage = percent_of(process_delta, system_delta);
        self.metrics.record_cpu_sample(process_usage);

        #[cfg(feature = "tracing")]
        trace!(
            process_delta_ns = process_delta,
            system_delta_ns = system_delta,
            threads = watched.len(),
            changed,
            "CPU accounting sample"
        );

        Ok(CpuSample {
            process_delta_ns: process_delta,
            system_delta_ns: system_delta,
            process_usage,
            threads: watched.len(),
            changed,
        })
    }
}

impl std::fmt::Debug for ProcessCpuCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessCpuCollector")
            .field("platform", &self.timer.platform_name())
            .field("logical_cpus", &self.logical_cpus)
            .field("watched", &self.watched.len())
            .finish()
    }
}

/// Runs a collector's [`sample`](CpuUsageCollector::sample) on every invocation
pub struct CollectorWorker {
    collector: Arc<dyn CpuUsageCollector>,
}

impl CollectorWorker {
    /// Wraps `collector`.
    pub fn new(collector: Arc<dyn CpuUsageCollector>) -> Self {
        Self { collector }
    }
}

impl Worker for CollectorWorker {
    fn run(&mut self, _ctx: &WorkerContext) -> Result<bool, WorkerError> {
        self.collector.sample()?;
        Ok(true)
    }
}
