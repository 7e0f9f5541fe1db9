//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Concurrency and caching substrate
//!
//! Supervised OS threads with cooperative cancellation and hang detection,
//! bounded-wait locks, age-evicting caches and per-thread CPU accounting.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

// Concurrency and caching substrate
/// Per-thread CPU share accounting
pub mod accounting;
/// Time-based eviction caches
pub mod cache;
/// Configuration and presets
pub mod config;
/// Supervisor event hooks
pub mod hooks;
/// Bounded-wait mutual exclusion
pub mod lock;
/// Metrics collection and reporting
pub mod metrics;
/// OS thread priority and identity
pub mod os_thread;
/// Process-wide lifecycle
pub mod substrate;
/// Managed-thread supervisor
pub mod supervisor;
/// Cross-platform CPU timing utilities
pub mod timing;

// Public API exports
pub use accounting::{CollectorWorker, CpuSample, CpuUsageCollector, ProcessCpuCollector};
pub use cache::{
    CacheError, CacheHooks, CacheItem, CacheManager, CacheManagerFactory, CacheSettings, CacheStats, CacheValue,
    Loader, RemovalReason,
};
pub use config::{ConfigError, ConfigProfile, CpuConfig, RegistryConfig, SubstrateConfig, SubstrateConfigBuilder};
pub use hooks::{ChannelHooks, HookRegistry, NullHooks, SupervisorEvent, SupervisorHooks};
pub use lock::{LockError, TimedGuard, TimedLock};
pub use metrics::{MetricsSnapshot, SubstrateMetrics};
pub use os_thread::{PriorityError, ThreadPriority};
pub use substrate::{Substrate, SubstrateError};
pub use supervisor::{
    worker_fn, CancellationToken, ExitReason, SupervisorError, ThreadManager, ThreadRegistry, ThreadSettings,
    ThreadSnapshot, ThreadState, Worker, WorkerContext, WorkerError, WorkerFailure,
};
pub use timing::{create_cpu_timer, CpuTimer, TimingError};
