//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Named registry of caches

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

use super::manager::{CacheManager, CacheSettings};
use super::CacheError;
use crate::config::CacheDefaults;
use crate::lock::{TimedGuard, TimedLock};
use crate::metrics::SubstrateMetrics;

type CacheTable = HashMap<String, Arc<CacheManager>>;

struct FactoryShared {
    caches: TimedLock<CacheTable>,
    defaults: CacheDefaults,
    metrics: Arc<SubstrateMetrics>,
}

/// Registry of named [`CacheManager`]s.
///
/// Cloning is cheap and every clone refers to the same set of caches.
/// Factory-wide operations snapshot the caches first, so the factory lock and
/// a cache lock are never held together.
#[derive(Clone)]
pub struct CacheManagerFactory {
    shared: Arc<FactoryShared>,
}

impl CacheManagerFactory {
    /// Creates an empty factory.
    pub fn new(defaults: CacheDefaults, metrics: Arc<SubstrateMetrics>) -> Self {
        let caches = TimedLock::with_timeout("cache-factory", HashMap::new(), defaults.lock_timeout);
        Self {
            shared: Arc::new(FactoryShared {
                caches,
                defaults,
                metrics,
            }),
        }
    }

    /// Defaults applied by [`create_cache`](Self::create_cache).
    pub fn defaults(&self) -> &CacheDefaults {
        &self.shared.defaults
    }

    /// Creates a cache using the factory's lock policy, no reset on read and
    /// clearing allowed.
    ///
    /// # Errors
    ///
    /// See [`create_cache_with`](Self::create_cache_with).
    pub fn create_cache(&self, name: &str, maximum_age: Duration) -> Result<Arc<CacheManager>, CacheError> {
        let defaults = &self.shared.defaults;
        let settings =
            CacheSettings::new(maximum_age).lock_policy(defaults.lock_timeout, defaults.lock_retries);
        self.create_cache_with(name, settings)
    }

    /// Creates a cache with explicit settings.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidName`] for an empty name,
    /// [`CacheError::AlreadyExists`] if the name is taken (the existing cache
    /// is left untouched), [`CacheError::Lock`] if the factory stays contended.
    pub fn create_cache_with(&self, name: &str, settings: CacheSettings) -> Result<Arc<CacheManager>, CacheError> {
        if name.trim().is_empty() {
            return Err(CacheError::InvalidName);
        }

        let mut caches = self.caches()?;
        if caches.contains_key(name) {
            return Err(CacheError::AlreadyExists(name.to_string()));
        }

        let manager = Arc::new(CacheManager::with_metrics(
            name.to_string(),
            settings,
            Arc::clone(&self.shared.metrics),
        ));
        caches.insert(name.to_string(), Arc::clone(&manager));

        #[cfg(feature = "tracing")]
        info!(
            cache = name,
            maximum_age_ms = manager.maximum_age().as_millis() as u64,
            reset_maximum_age = manager.reset_maximum_age(),
            allow_clear_all = manager.allow_clear_all(),
            "Cache created"
        );

        Ok(manager)
    }

    /// The cache named `name`.
    ///
    /// # Errors
    ///
    /// [`CacheError::NotFound`] if absent, [`CacheError::Lock`] if the factory
    /// stays contended.
    pub fn get_cache(&self, name: &str) -> Result<Arc<CacheManager>, CacheError> {
        self.get_cache_if_exists(name)?
            .ok_or_else(|| CacheError::NotFound(name.to_string()))
    }

    /// The cache named `name`, or `None`.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the factory stays contended.
    pub fn get_cache_if_exists(&self, name: &str) -> Result<Option<Arc<CacheManager>>, CacheError> {
        Ok(self.caches()?.get(name).cloned())
    }

    /// Whether a cache named `name` exists.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the factory stays contended.
    pub fn cache_exists(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches()?.contains_key(name))
    }

    /// Deregisters the cache named `name`, returning it if present.
    ///
    /// Holders of the returned `Arc` can keep using it.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the factory stays contended.
    pub fn remove_cache(&self, name: &str) -> Result<Option<Arc<CacheManager>>, CacheError> {
        let removed = self.caches()?.remove(name);

        #[cfg(feature = "tracing")]
        if removed.is_some() {
            debug!(cache = name, "Cache removed");
        }

        Ok(removed)
    }

    /// Sorted cache names.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the factory stays contended.
    pub fn cache_names(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<String> = self.caches()?.keys().cloned().collect();
        names.sort_unstable();
        Ok(names)
    }

    /// Number of caches.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the factory stays contended.
    pub fn cache_count(&self) -> Result<usize, CacheError> {
        Ok(self.caches()?.len())
    }

    /// Clears every cache that allows it, returning the items removed.
    ///
    /// A cache that stays contended is skipped and logged.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the factory stays contended.
    pub fn clear_all_caches(&self) -> Result<usize, CacheError> {
        let mut total = 0;
        for manager in self.snapshot()? {
            if !manager.allow_clear_all() {
                continue;
            }
            match manager.clear() {
                Ok(count) => total += count,
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    warn!(cache = manager.name(), error = %_err, "Cache skipped during clear");
                }
            }
        }
        Ok(total)
    }

    /// Sweeps expired items from every cache, returning the items evicted.
    ///
    /// A cache that stays contended is skipped and logged.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the factory stays contended.
    pub fn clean_all_caches(&self) -> Result<usize, CacheError> {
        let mut total = 0;
        for manager in self.snapshot()? {
            match manager.clean_cached_items() {
                Ok(count) => total += count,
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    warn!(cache = manager.name(), error = %_err, "Cache skipped during sweep");
                }
            }
        }
        Ok(total)
    }

    fn snapshot(&self) -> Result<Vec<Arc<CacheManager>>, CacheError> {
        Ok(self.caches()?.values().cloned().collect())
    }

    fn caches(&self) -> Result<TimedGuard<'_, CacheTable>, CacheError> {
        let defaults = &self.shared.defaults;
        self.shared
            .caches
            .lock_with_retry(defaults.lock_timeout, defaults.lock_retries)
            .map_err(|err| {
                if err.is_timeout() {
                    self.shared.metrics.record_lock_timeout();
                }
                CacheError::from(err)
            })
    }
}

impl Default for CacheManagerFactory {
    fn default() -> Self {
        Self::new(CacheDefaults::default(), Arc::new(SubstrateMetrics::new()))
    }
}

impl std::fmt::Debug for CacheManagerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManagerFactory")
            .field("defaults", &self.shared.defaults)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_get() {
        let factory = CacheManagerFactory::default();
        let cache = factory.create_cache("errors", Duration::from_secs(60)).unwrap();

        assert!(factory.cache_exists("errors").unwrap());
        assert!(Arc::ptr_eq(&cache, &factory.get_cache("errors").unwrap()));
        assert_eq!(cache.settings().lock_retries, factory.defaults().lock_retries);
        assert_eq!(factory.cache_names().unwrap(), vec!["errors".to_string()]);
    }

    #[test]
    fn test_invalid_and_duplicate_names() {
        let factory = CacheManagerFactory::default();
        assert!(matches!(
            factory.create_cache("", Duration::from_secs(1)),
            Err(CacheError::InvalidName)
        ));
        assert!(matches!(
            factory.create_cache(" \t", Duration::from_secs(1)),
            Err(CacheError::InvalidName)
        ));

        let original = factory.create_cache("dup", Duration::from_secs(1)).unwrap();
        original.add_value("k", 1u8, false).unwrap();

        let err = factory.create_cache("dup", Duration::from_secs(99)).unwrap_err();
        assert!(matches!(err, CacheError::AlreadyExists(ref n) if n == "dup"));

        let still = factory.get_cache("dup").unwrap();
        assert_eq!(still.maximum_age(), Duration::from_secs(1));
        assert!(still.contains("k").unwrap());
    }

    #[test]
    fn test_missing_cache() {
        let factory = CacheManagerFactory::default();
        assert!(matches!(factory.get_cache("missing"), Err(CacheError::NotFound(_))));
        assert!(factory.get_cache_if_exists("missing").unwrap().is_none());
        assert!(factory.remove_cache("missing").unwrap().is_none());
    }

    #[test]
    fn test_remove_cache() {
        let factory = CacheManagerFactory::default();
        factory.create_cache("temp", Duration::from_secs(1)).unwrap();

        let removed = factory.remove_cache("temp").unwrap().unwrap();
        assert_eq!(removed.name(), "temp");
        assert!(!factory.cache_exists("temp").unwrap());
        assert_eq!(factory.cache_count().unwrap(), 0);

        // Name is free again
        assert!(factory.create_cache("temp", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_clear_all_skips_protected_caches() {
        let factory = CacheManagerFactory::default();
        let open = factory.create_cache("open", Duration::from_secs(60)).unwrap();
        let pinned = factory
            .create_cache_with("pinned", CacheSettings::new(Duration::from_secs(60)).allow_clear_all(false))
            .unwrap();

        open.add_value("a", 1u8, false).unwrap();
        open.add_value("b", 2u8, false).unwrap();
        pinned.add_value("c", 3u8, false).unwrap();

        assert_eq!(factory.clear_all_caches().unwrap(), 2);
        assert_eq!(open.count().unwrap(), 0);
        assert_eq!(pinned.count().unwrap(), 1);
    }

    #[test]
    fn test_clean_all_sweeps_every_cache() {
        let metrics = Arc::new(SubstrateMetrics::new());
        let factory = CacheManagerFactory::new(CacheDefaults::default(), Arc::clone(&metrics));
        let short = factory.create_cache("short", Duration::from_millis(10)).unwrap();
        let pinned = factory
            .create_cache_with("pinned", CacheSettings::new(Duration::from_millis(10)).allow_clear_all(false))
            .unwrap();
        let long = factory.create_cache("long", Duration::from_secs(60)).unwrap();

        short.add_value("x", (), false).unwrap();
        pinned.add_value("y", (), false).unwrap();
        long.add_value("z", (), false).unwrap();
        std::thread::sleep(Duration::from_millis(25));

        // Sweeps ignore allow_clear_all
        assert_eq!(factory.clean_all_caches().unwrap(), 2);
        assert_eq!(long.count().unwrap(), 1);
        assert_eq!(metrics.snapshot().cache_evictions, 2);
    }
}
