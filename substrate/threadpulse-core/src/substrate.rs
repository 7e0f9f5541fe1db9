//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Process-wide substrate lifecycle
//!
//! A [`Substrate`] owns the thread registry, the cache factory and the
//! background threads that serve them: the watchdog, the cache sweeper and,
//! when enabled, the CPU collector. Create one with [`Substrate::initialise`]
//! and shut it down with [`Substrate::finalise`]. Code that needs a single
//! per-process instance can park it in the global slot with
//! [`Substrate::install_global`].

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

#[cfg(feature = "tracing")]
use tracing::{info, warn};

use crate::accounting::{CollectorWorker, CpuUsageCollector, ProcessCpuCollector};
use crate::cache::{CacheError, CacheManagerFactory, SweeperWorker};
use crate::config::{ConfigError, SubstrateConfig};
use crate::hooks::HookRegistry;
use crate::metrics::SubstrateMetrics;
use crate::os_thread::ThreadPriority;
use crate::supervisor::{SupervisorError, ThreadManager, ThreadRegistry, ThreadSettings, Worker};

/// Name of the watchdog thread
pub const WATCHDOG_THREAD_NAME: &str = "threadpulse-watchdog";
/// Name of the cache sweeper thread
pub const SWEEPER_THREAD_NAME: &str = "threadpulse-cache-sweeper";
/// Name of the CPU collector thread
pub const COLLECTOR_THREAD_NAME: &str = "threadpulse-cpu";

static GLOBAL: RwLock<Option<Arc<Substrate>>> = parking_lot::const_rwlock(None);

/// Errors raised while bringing the substrate up or down
#[derive(Debug, Error)]
pub enum SubstrateError {
    /// The global slot is already occupied
    #[error("a global substrate is already installed")]
    AlreadyInitialised,

    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A background thread could not be started or stopped
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// Cache factory failure
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Owner of the registry, the cache factory and their background threads
pub struct Substrate {
    config: SubstrateConfig,
    metrics: Arc<SubstrateMetrics>,
    hooks: Arc<HookRegistry>,
    registry: ThreadRegistry,
    caches: CacheManagerFactory,
    collector: Option<Arc<ProcessCpuCollector>>,
    finalised: AtomicBool,
}

impl Substrate {
    /// Validates `config`, builds the registries and starts the background
    /// threads it asks for.
    ///
    /// # Errors
    ///
    /// [`SubstrateError::Config`] for an invalid configuration,
    /// [`SubstrateError::Supervisor`] if a background thread fails to start.
    /// Threads already started are cancelled before the error is returned.
    pub fn initialise(config: SubstrateConfig) -> Result<Arc<Self>, SubstrateError> {
        config.validate()?;

        let metrics = Arc::new(SubstrateMetrics::new());
        let hooks = Arc::new(HookRegistry::new());
        let registry = ThreadRegistry::new(config.registry.clone(), Arc::clone(&hooks), Arc::clone(&metrics));
        let caches = CacheManagerFactory::new(config.cache.clone(), Arc::clone(&metrics));

        let collector = config.cpu.enabled.then(|| {
            let collector = ProcessCpuCollector::new(Arc::clone(&hooks), Arc::clone(&metrics))
                .min_sampling_interval(config.cpu.min_sampling_interval);
            Arc::new(collector)
        });

        let substrate = Arc::new(Self {
            config,
            metrics,
            hooks,
            registry,
            caches,
            collector,
            finalised: AtomicBool::new(false),
        });

        if let Err(err) = substrate.start_background_threads() {
            #[cfg(feature = "tracing")]
            warn!(error = %err, "Substrate start aborted");

            if let Err(_cleanup) = substrate.registry.finalise() {
                #[cfg(feature = "tracing")]
                warn!(error = %_cleanup, "Background threads left running after failed start");
            }
            return Err(err);
        }

        #[cfg(feature = "tracing")]
        info!(
            max_running_threads = substrate.config.registry.max_running_threads,
            cpu_accounting = substrate.config.cpu.enabled,
            sweep_interval_ms = substrate.config.cache.sweep_interval.as_millis() as u64,
            "Substrate initialised"
        );

        Ok(substrate)
    }

    fn start_background_threads(&self) -> Result<(), SubstrateError> {
        if let Some(collector) = &self.collector {
            let collector: Arc<dyn CpuUsageCollector> = collector.clone();
            self.registry.attach_collector(Arc::clone(&collector));
            self.start_service(
                CollectorWorker::new(collector),
                self.config.cpu.sample_interval,
                COLLECTOR_THREAD_NAME,
            )?;
        }

        let watchdog_interval = self.config.registry.watchdog_interval;
        if !watchdog_interval.is_zero() {
            self.start_service(self.registry.watchdog(), watchdog_interval, WATCHDOG_THREAD_NAME)?;
        }

        let sweep_interval = self.config.cache.sweep_interval;
        if !sweep_interval.is_zero() {
            self.start_service(SweeperWorker::new(self.caches.clone()), sweep_interval, SWEEPER_THREAD_NAME)?;
        }

        Ok(())
    }

    fn start_service<W: Worker>(
        &self,
        worker: W,
        interval: std::time::Duration,
        name: &str,
    ) -> Result<(), SupervisorError> {
        let manager = ThreadManager::new(worker, ThreadSettings::every(interval));
        self.registry.thread_start(&manager, name, ThreadPriority::BelowNormal, false)
    }

    /// Cancels every supervised thread, background threads included, and
    /// rejects further starts. Idempotent.
    ///
    /// Returns how many threads were cancelled by this call.
    ///
    /// # Errors
    ///
    /// [`SubstrateError::Supervisor`] if the registry stays contended.
    pub fn finalise(&self) -> Result<usize, SubstrateError> {
        let first = !self.finalised.swap(true, Ordering::AcqRel);
        let cancelled = self.registry.finalise()?;
        self.registry.detach_collector();

        if first {
            #[cfg(feature = "tracing")]
            info!(cancelled, "Substrate finalised");

            self.metrics.log_summary();
        }
        Ok(cancelled)
    }

    /// Whether [`finalise`](Self::finalise) has run.
    pub fn is_finalised(&self) -> bool {
        self.finalised.load(Ordering::Acquire)
    }

    /// Configuration the substrate was built with.
    pub fn config(&self) -> &SubstrateConfig {
        &self.config
    }

    /// Thread registry.
    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    /// Cache factory.
    pub fn caches(&self) -> &CacheManagerFactory {
        &self.caches
    }

    /// Supervisor hook slot.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Shared counters.
    pub fn metrics(&self) -> &Arc<SubstrateMetrics> {
        &self.metrics
    }

    /// CPU collector, present when accounting is enabled.
    pub fn collector(&self) -> Option<&Arc<ProcessCpuCollector>> {
        self.collector.as_ref()
    }

    /// Initialises a substrate and installs it in the global slot.
    ///
    /// # Errors
    ///
    /// [`SubstrateError::AlreadyInitialised`] if the slot is occupied (the
    /// configuration is not used), otherwise as [`initialise`](Self::initialise).
    pub fn install_global(config: SubstrateConfig) -> Result<Arc<Self>, SubstrateError> {
        let mut slot = GLOBAL.write();
        if slot.is_some() {
            return Err(SubstrateError::AlreadyInitialised);
        }
        let substrate = Self::initialise(config)?;
        *slot = Some(Arc::clone(&substrate));
        Ok(substrate)
    }

    /// The globally installed substrate.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.read().clone()
    }

    /// Empties the global slot and finalises the substrate it held.
    ///
    /// Returns `Ok(false)` if the slot was empty.
    ///
    /// # Errors
    ///
    /// As [`finalise`](Self::finalise); the slot is emptied regardless.
    pub fn finalise_global() -> Result<bool, SubstrateError> {
        let Some(substrate) = GLOBAL.write().take() else {
            return Ok(false);
        };
        substrate.finalise()?;
        Ok(true)
    }
}

impl std::fmt::Debug for Substrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Substrate")
            .field("config", &self.config)
            .field("cpu_accounting", &self.collector.is_some())
            .field("finalised", &self.is_finalised())
            .finish_non_exhaustive()
    }
}
