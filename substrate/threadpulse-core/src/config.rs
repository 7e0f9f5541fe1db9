//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Substrate configuration and presets

#![forbid(unsafe_code)]

use std::time::Duration;
use thiserror::Error;

use crate::accounting::DEFAULT_MIN_SAMPLING_INTERVAL;
use crate::lock::{DEFAULT_LOCK_RETRIES, DEFAULT_LOCK_TIMEOUT};

/// Default cap on concurrently registered supervised threads
pub const DEFAULT_MAX_RUNNING_THREADS: usize = 128;

/// Default wait for a cancelled thread to exit before it is detached
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Rejected configuration value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: `{field}` {reason}")]
pub struct ConfigError {
    /// Offending field
    pub field: &'static str,
    /// What is wrong with it
    pub reason: &'static str,
}

impl ConfigError {
    fn new(field: &'static str, reason: &'static str) -> Self {
        Self { field, reason }
    }
}

/// Thread registry settings
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// Starts beyond this many registered threads are rejected
    pub max_running_threads: usize,
    /// Wait for the registry table lock
    pub lock_timeout: Duration,
    /// Attempts before a table lock timeout is returned
    pub lock_retries: u32,
    /// Wait for each cancelled thread to exit
    pub join_timeout: Duration,
    /// Spacing of watchdog sweeps; zero disables the watchdog thread
    pub watchdog_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_running_threads: DEFAULT_MAX_RUNNING_THREADS,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_retries: DEFAULT_LOCK_RETRIES,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            watchdog_interval: Duration::from_secs(1),
        }
    }
}

/// CPU accounting settings
#[derive(Debug, Clone, PartialEq)]
pub struct CpuConfig {
    /// Run the collector thread
    pub enabled: bool,
    /// Spacing of accounting samples
    pub sample_interval: Duration,
    /// Minimum spacing of process usage computations
    pub min_sampling_interval: Duration,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_interval: Duration::from_secs(1),
            min_sampling_interval: DEFAULT_MIN_SAMPLING_INTERVAL,
        }
    }
}

/// Settings shared by every cache the factory creates
#[derive(Debug, Clone, PartialEq)]
pub struct CacheDefaults {
    /// Wait for a cache's item lock
    pub lock_timeout: Duration,
    /// Attempts before a cache lock timeout is returned
    pub lock_retries: u32,
    /// Spacing of expiry sweeps; zero disables the sweeper thread
    pub sweep_interval: Duration,
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_retries: DEFAULT_LOCK_RETRIES,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Complete substrate configuration
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubstrateConfig {
    /// Thread registry
    pub registry: RegistryConfig,
    /// CPU accounting
    pub cpu: CpuConfig,
    /// Cache factory
    pub cache: CacheDefaults,
}

impl SubstrateConfig {
    /// Starts a builder from the defaults.
    #[must_use]
    pub fn builder() -> SubstrateConfigBuilder {
        SubstrateConfigBuilder::default()
    }

    /// Checks values that would make the substrate misbehave.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.max_running_threads == 0 {
            return Err(ConfigError::new("registry.max_running_threads", "must be at least 1"));
        }
        if self.registry.lock_timeout.is_zero() {
            return Err(ConfigError::new("registry.lock_timeout", "must be non-zero"));
        }
        if self.registry.lock_retries == 0 {
            return Err(ConfigError::new("registry.lock_retries", "must be at least 1"));
        }
        if self.cache.lock_timeout.is_zero() {
            return Err(ConfigError::new("cache.lock_timeout", "must be non-zero"));
        }
        if self.cache.lock_retries == 0 {
            return Err(ConfigError::new("cache.lock_retries", "must be at least 1"));
        }
        if self.cpu.enabled && self.cpu.sample_interval.is_zero() {
            return Err(ConfigError::new("cpu.sample_interval", "must be non-zero when accounting is enabled"));
        }
        Ok(())
    }
}

/// Builder for [`SubstrateConfig`]
#[derive(Debug, Clone, Default)]
pub struct SubstrateConfigBuilder {
    config: SubstrateConfig,
}

impl SubstrateConfigBuilder {
    /// Starts from a preset.
    #[must_use]
    pub fn from_profile(profile: ConfigProfile) -> Self {
        Self {
            config: profile.create_config(),
        }
    }

    /// Caps registered threads.
    #[must_use]
    pub fn max_running_threads(mut self, limit: usize) -> Self {
        self.config.registry.max_running_threads = limit;
        self
    }

    /// Sets the lock timeout for the registry and every cache.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.registry.lock_timeout = timeout;
        self.config.cache.lock_timeout = timeout;
        self
    }

    /// Sets lock retries for the registry and every cache.
    #[must_use]
    pub fn lock_retries(mut self, attempts: u32) -> Self {
        self.config.registry.lock_retries = attempts;
        self.config.cache.lock_retries = attempts;
        self
    }

    /// Sets the join wait for cancelled threads.
    #[must_use]
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.config.registry.join_timeout = timeout;
        self
    }

    /// Sets the watchdog sweep spacing; zero disables it.
    #[must_use]
    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.config.registry.watchdog_interval = interval;
        self
    }

    /// Enables CPU accounting sampled every `interval`.
    #[must_use]
    pub fn cpu_accounting(mut self, interval: Duration) -> Self {
        self.config.cpu.enabled = true;
        self.config.cpu.sample_interval = interval;
        self
    }

    /// Sets the minimum spacing of process usage computations.
    #[must_use]
    pub fn min_sampling_interval(mut self, interval: Duration) -> Self {
        self.config.cpu.min_sampling_interval = interval;
        self
    }

    /// Sets the cache sweep spacing; zero disables it.
    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.cache.sweep_interval = interval;
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// See [`SubstrateConfig::validate`].
    pub fn build(self) -> Result<SubstrateConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigProfile {
    /// Short lock waits, frequent watchdog and sweeps, CPU accounting on.
    ///
    /// Best for: interactive services where stalls must surface quickly
    Responsive,

    /// The defaults.
    ///
    /// Best for: general-purpose processes
    Balanced,

    /// Long lock waits and infrequent background work.
    ///
    /// Best for: batch jobs where background threads should stay quiet
    Relaxed,
}

impl ConfigProfile {
    /// Builds the configuration for this preset.
    ///
    /// ```rust
    /// use threadpulse_core::config::ConfigProfile;
    ///
    /// let config = ConfigProfile::Responsive.create_config();
    /// assert!(config.cpu.enabled);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn create_config(self) -> SubstrateConfig {
        match self {
            ConfigProfile::Responsive => SubstrateConfig {
                registry: RegistryConfig {
                    lock_timeout: Duration::from_secs(1),
                    join_timeout: Duration::from_secs(2),
                    watchdog_interval: Duration::from_millis(250),
                    ..RegistryConfig::default()
                },
                cpu: CpuConfig {
                    enabled: true,
                    sample_interval: Duration::from_millis(500),
                    min_sampling_interval: Duration::from_millis(250),
                },
                cache: CacheDefaults {
                    lock_timeout: Duration::from_secs(1),
                    sweep_interval: Duration::from_secs(5),
                    ..CacheDefaults::default()
                },
            },
            ConfigProfile::Balanced => SubstrateConfig::default(),
            ConfigProfile::Relaxed => SubstrateConfig {
                registry: RegistryConfig {
                    lock_timeout: Duration::from_secs(15),
                    lock_retries: 3,
                    join_timeout: Duration::from_secs(30),
                    watchdog_interval: Duration::from_secs(5),
                    ..RegistryConfig::default()
                },
                cpu: CpuConfig::default(),
                cache: CacheDefaults {
                    lock_timeout: Duration::from_secs(15),
                    lock_retries: 3,
                    sweep_interval: Duration::from_secs(120),
                },
            },
        }
    }

    /// Human readable description.
    pub fn description(self) -> &'static str {
        match self {
            ConfigProfile::Responsive => {
                "Short lock waits, a 250ms watchdog and CPU accounting. \
                 Best for interactive services where stalls must surface quickly."
            }
            ConfigProfile::Balanced => {
                "Default lock waits, a one second watchdog and 30 second cache sweeps. \
                 Best for general-purpose processes."
            }
            ConfigProfile::Relaxed => {
                "Long lock waits and infrequent background work. \
                 Best for batch jobs."
            }
        }
    }

    /// Every preset.
    pub fn all_profiles() -> &'static [ConfigProfile] {
        &[ConfigProfile::Responsive, ConfigProfile::Balanced, ConfigProfile::Relaxed]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SubstrateConfig::default();
        assert_eq!(config.registry.max_running_threads, 128);
        assert_eq!(config.registry.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.registry.lock_retries, 5);
        assert_eq!(config.registry.join_timeout, Duration::from_secs(10));
        assert!(!config.cpu.enabled);
        assert_eq!(config.cpu.min_sampling_interval, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_every_profile_validates() {
        for profile in ConfigProfile::all_profiles() {
            assert!(profile.create_config().validate().is_ok(), "{profile:?}");
            assert!(!profile.description().is_empty());
        }
        assert_eq!(ConfigProfile::Balanced.create_config(), SubstrateConfig::default());
    }

    #[test]
    fn test_builder() {
        let config = SubstrateConfig::builder()
            .max_running_threads(4)
            .lock_timeout(Duration::from_millis(200))
            .lock_retries(2)
            .cpu_accounting(Duration::from_millis(100))
            .sweep_interval(Duration::ZERO)
            .build()
            .unwrap();

        assert_eq!(config.registry.max_running_threads, 4);
        assert_eq!(config.cache.lock_timeout, Duration::from_millis(200));
        assert_eq!(config.cache.lock_retries, 2);
        assert!(config.cpu.enabled);
        assert!(config.cache.sweep_interval.is_zero());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = SubstrateConfig::builder().max_running_threads(0).build().unwrap_err();
        assert_eq!(err.field, "registry.max_running_threads");

        let err = SubstrateConfig::builder().lock_retries(0).build().unwrap_err();
        assert_eq!(err.field, "registry.lock_retries");

        let err = SubstrateConfig::builder()
            .cpu_accounting(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err.field, "cpu.sample_interval");
    }

    #[test]
    fn test_builder_from_profile() {
        let config = SubstrateConfigBuilder::from_profile(ConfigProfile::Relaxed)
            .watchdog_interval(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(config.registry.lock_retries, 3);
        assert!(config.registry.watchdog_interval.is_zero());
    }
}
