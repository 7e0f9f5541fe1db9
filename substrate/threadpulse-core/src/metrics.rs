//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Metrics collection for supervised threads and caches
//!
//! Counters are plain atomics so they are always available. With the
//! `metrics` feature every record is mirrored into the `metrics` facade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use ::metrics::{counter, gauge, histogram};

#[cfg(feature = "tracing")]
use tracing::{debug, info};

/// Shared counters for one substrate instance
#[derive(Debug)]
pub struct SubstrateMetrics {
    /// Supervised threads started
    pub threads_started: AtomicU64,

    /// Supervised threads that left their run loop for any reason
    pub threads_exited: AtomicU64,

    /// Cancellation requests delivered to running threads
    pub threads_cancelled: AtomicU64,

    /// Work invocations that returned an error or panicked
    pub worker_failures: AtomicU64,

    /// Invocations flagged by the watchdog
    pub hang_detections: AtomicU64,

    /// Lock acquisitions that timed out inside registries and caches
    pub lock_timeouts: AtomicU64,

    /// Cache lookups answered from the map
    pub cache_hits: AtomicU64,

    /// Cache lookups that missed the map
    pub cache_misses: AtomicU64,

    /// Misses satisfied by a not-found subscriber
    pub cache_lazy_loads: AtomicU64,

    /// Items removed by age-based sweeps
    pub cache_evictions: AtomicU64,

    /// CPU accounting samples taken
    pub cpu_samples: AtomicU64,

    /// CPU change notifications raised
    pub cpu_change_notifications: AtomicU64,

    start_time: Instant,
}

impl SubstrateMetrics {
    /// Create new metrics instance
    #[must_use]
    pub fn new() -> Self {
        Self {
            threads_started: AtomicU64::new(0),
            threads_exited: AtomicU64::new(0),
            threads_cancelled: AtomicU64::new(0),
            worker_failures: AtomicU64::new(0),
            hang_detections: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_lazy_loads: AtomicU64::new(0),
            cache_evictions: AtomicU64::new(0),
            cpu_samples: AtomicU64::new(0),
            cpu_change_notifications: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a supervised thread start
    pub fn record_thread_started(&self, name: &str) {
        self.threads_started.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        debug!(thread = name, "Supervised thread started");
        #[cfg(not(feature = "tracing"))]
        let _ = name;

        #[cfg(feature = "metrics")]
        {
            counter!("threadpulse_threads_started_total").increment(1);
            gauge!("threadpulse_threads_running").increment(1.0);
        }
    }

    /// Record a supervised thread leaving its run loop
    pub fn record_thread_exited(&self, run_time: Duration) {
        self.threads_exited.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        {
            counter!("threadpulse_threads_exited_total").increment(1);
            gauge!("threadpulse_threads_running").decrement(1.0);
            histogram!("threadpulse_thread_lifetime_seconds").record(run_time.as_secs_f64());
        }
        #[cfg(not(feature = "metrics"))]
        let _ = run_time;
    }

    /// Record a cancellation request
    pub fn record_thread_cancelled(&self) {
        self.threads_cancelled.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("threadpulse_threads_cancelled_total").increment(1);
    }

    /// Record a failed work invocation
    pub fn record_worker_failure(&self) {
        self.worker_failures.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("threadpulse_worker_failures_total").increment(1);
    }

    /// Record a watchdog detection
    pub fn record_hang_detected(&self) {
        self.hang_detections.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("threadpulse_hang_detections_total").increment(1);
    }

    /// Record a lock timeout surfaced by a registry or cache
    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache hit
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("threadpulse_cache_hits_total").increment(1);
    }

    /// Record a cache miss
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("threadpulse_cache_misses_total").increment(1);
    }

    /// Record a miss filled by a subscriber
    pub fn record_cache_lazy_load(&self) {
        self.cache_lazy_loads.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("threadpulse_cache_lazy_loads_total").increment(1);
    }

    /// Record items evicted by a sweep
    pub fn record_cache_evictions(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.cache_evictions.fetch_add(count, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        debug!(evicted = count, "Cache sweep evicted items");

        #[cfg(feature = "metrics")]
        counter!("threadpulse_cache_evictions_total").increment(count);
    }

    /// Record a CPU accounting sample
    pub fn record_cpu_sample(&self, process_usage: f64) {
        self.cpu_samples.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        gauge!("threadpulse_process_cpu_percent").set(process_usage);
        #[cfg(not(feature = "metrics"))]
        let _ = process_usage;
    }

    /// Record a CPU change notification
    pub fn record_cpu_change(&self) {
        self.cpu_change_notifications.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("threadpulse_cpu_change_notifications_total").increment(1);
    }

    /// Time since the metrics were created
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            threads_started: self.threads_started.load(Ordering::Relaxed),
            threads_exited: self.threads_exited.load(Ordering::Relaxed),
            threads_cancelled: self.threads_cancelled.load(Ordering::Relaxed),
            worker_failures: self.worker_failures.load(Ordering::Relaxed),
            hang_detections: self.hang_detections.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_lazy_loads: self.cache_lazy_loads.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            cpu_samples: self.cpu_samples.load(Ordering::Relaxed),
            cpu_change_notifications: self.cpu_change_notifications.load(Ordering::Relaxed),
            uptime: self.uptime(),
        }
    }

    /// Log a one-line summary
    pub fn log_summary(&self) {
        #[cfg(feature = "tracing")]
        {
            let snapshot = self.snapshot();
            info!(
                threads_started = snapshot.threads_started,
                threads_exited = snapshot.threads_exited,
                worker_failures = snapshot.worker_failures,
                hang_detections = snapshot.hang_detections,
                cache_hit_rate = snapshot.cache_hit_rate(),
                uptime_secs = snapshot.uptime.as_secs(),
                "Substrate metrics summary"
            );
        }
    }
}

impl Default for SubstrateMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of [`SubstrateMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Supervised threads started
    pub threads_started: u64,
    /// Supervised threads exited
    pub threads_exited: u64,
    /// Cancellation requests delivered
    pub threads_cancelled: u64,
    /// Failed invocations
    pub worker_failures: u64,
    /// Watchdog detections
    pub hang_detections: u64,
    /// Lock timeouts
    pub lock_timeouts: u64,
    /// Cache hits
    pub cache_hits: u64,
    /// Cache misses
    pub cache_misses: u64,
    /// Misses filled lazily
    pub cache_lazy_loads: u64,
    /// Items evicted by sweeps
    pub cache_evictions: u64,
    /// CPU samples taken
    pub cpu_samples: u64,
    /// CPU change notifications
    pub cpu_change_notifications: u64,
    /// Time since creation
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Threads currently inside their run loop
    pub fn threads_running(&self) -> u64 {
        self.threads_started.saturating_sub(self.threads_exited)
    }

    /// Hit ratio in `[0.0, 1.0]`; zero before any lookup
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = SubstrateMetrics::new();
        metrics.record_thread_started("a");
        metrics.record_thread_started("b");
        metrics.record_thread_exited(Duration::from_millis(5));
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_cache_evictions(0);
        metrics.record_cache_evictions(4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.threads_started, 2);
        assert_eq!(snapshot.threads_running(), 1);
        assert_eq!(snapshot.cache_evictions, 4);
        assert!((snapshot.cache_hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hit_rate_without_lookups() {
        let snapshot = SubstrateMetrics::default().snapshot();
        assert_eq!(snapshot.cache_hit_rate(), 0.0);
    }
}
