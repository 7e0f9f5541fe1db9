//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Named cache with age-based eviction
//!
//! Every read and write of the item map happens inside the cache's
//! [`TimedLock`]. Subscribers are notified after the lock is released, so a
//! subscriber may call back into the same cache.

#![forbid(unsafe_code)]

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

#[cfg(feature = "tracing")]
use tracing::{debug, trace};

use super::events::{CacheHooks, RemovalReason};
use super::item::{CacheItem, CacheValue};
use super::CacheError;
use crate::lock::{TimedGuard, TimedLock, DEFAULT_LOCK_RETRIES, DEFAULT_LOCK_TIMEOUT};
use crate::metrics::SubstrateMetrics;

type ItemMap = HashMap<String, CacheItem>;

/// Per-cache behaviour
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    /// Items not refreshed for longer than this are evicted by a sweep
    pub maximum_age: Duration,
    /// Reads refresh an item's age
    pub reset_maximum_age: bool,
    /// Whether [`CacheManager::clear`] and factory-wide clears may empty this cache
    pub allow_clear_all: bool,
    /// Wait for the item lock
    pub lock_timeout: Duration,
    /// Attempts before a lock timeout is returned
    pub lock_retries: u32,
}

impl CacheSettings {
    /// Settings with the given maximum age and defaults elsewhere.
    #[must_use]
    pub fn new(maximum_age: Duration) -> Self {
        Self {
            maximum_age,
            reset_maximum_age: false,
            allow_clear_all: true,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_retries: DEFAULT_LOCK_RETRIES,
        }
    }

    /// Sets whether reads refresh an item's age.
    #[must_use]
    pub fn reset_maximum_age(mut self, enabled: bool) -> Self {
        self.reset_maximum_age = enabled;
        self
    }

    /// Sets whether clears may empty this cache.
    #[must_use]
    pub fn allow_clear_all(mut self, enabled: bool) -> Self {
        self.allow_clear_all = enabled;
        self
    }

    /// Sets the lock wait and retry count.
    #[must_use]
    pub fn lock_policy(mut self, timeout: Duration, retries: u32) -> Self {
        self.lock_timeout = timeout;
        self.lock_retries = retries.max(1);
        self
    }
}

/// Counters for one cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Lookups answered from the map
    pub hits: u64,
    /// Lookups that missed the map
    pub misses: u64,
    /// Misses answered by a subscriber
    pub lazy_loads: u64,
    /// Items removed by sweeps
    pub evictions: u64,
    /// Items inserted
    pub inserts: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    lazy_loads: AtomicU64,
    evictions: AtomicU64,
    inserts: AtomicU64,
}

/// Named collection of [`CacheItem`]s
pub struct CacheManager {
    name: String,
    settings: CacheSettings,
    items: TimedLock<ItemMap>,
    subscribers: RwLock<Vec<Arc<dyn CacheHooks>>>,
    stats: StatsCounters,
    metrics: Option<Arc<SubstrateMetrics>>,
}

impl CacheManager {
    /// Creates a standalone cache.
    pub fn new(name: impl Into<String>, settings: CacheSettings) -> Self {
        Self::build(name.into(), settings, None)
    }

    pub(crate) fn with_metrics(name: String, settings: CacheSettings, metrics: Arc<SubstrateMetrics>) -> Self {
        Self::build(name, settings, Some(metrics))
    }

    fn build(name: String, settings: CacheSettings, metrics: Option<Arc<SubstrateMetrics>>) -> Self {
        let items = TimedLock::with_timeout(format!("cache:{name}"), HashMap::new(), settings.lock_timeout);
        Self {
            name,
            settings,
            items,
            subscribers: RwLock::new(Vec::new()),
            stats: StatsCounters::default(),
            metrics,
        }
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cache settings.
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Eviction threshold.
    pub fn maximum_age(&self) -> Duration {
        self.settings.maximum_age
    }

    /// Whether reads refresh an item's age.
    pub fn reset_maximum_age(&self) -> bool {
        self.settings.reset_maximum_age
    }

    /// Whether clears may empty this cache.
    pub fn allow_clear_all(&self) -> bool {
        self.settings.allow_clear_all
    }

    /// Adds a subscriber. Not-found subscribers are consulted in subscription order.
    pub fn subscribe(&self, hooks: Arc<dyn CacheHooks>) {
        self.subscribers.write().push(hooks);
    }

    /// Removes every subscriber, returning how many there were.
    pub fn unsubscribe_all(&self) -> usize {
        let mut subscribers = self.subscribers.write();
        let count = subscribers.len();
        subscribers.clear();
        count
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Inserts `value` under `name`.
    ///
    /// If `name` is present and `delete_if_exists` is false nothing changes and
    /// the existing item is returned. With `delete_if_exists` the old item is
    /// replaced and the new one starts with fresh timestamps.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidName`] for an empty name, [`CacheError::Lock`] if
    /// the cache stays contended.
    pub fn add(&self, name: &str, value: CacheValue, delete_if_exists: bool) -> Result<CacheItem, CacheError> {
        if name.is_empty() {
            return Err(CacheError::InvalidName);
        }

        let (item, replaced) = {
            let mut items = self.lock_items()?;
            match items.entry(name.to_string()) {
                Entry::Occupied(existing) if !delete_if_exists => return Ok(existing.get().clone()),
                Entry::Occupied(mut existing) => {
                    let item = CacheItem::new(name.to_string(), value);
                    let old = existing.insert(item.clone());
                    (item, Some(old))
                }
                Entry::Vacant(slot) => (slot.insert(CacheItem::new(name.to_string(), value)).clone(), None),
            }
        };

        self.stats.inserts.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        trace!(cache = %self.name, item = name, replaced = replaced.is_some(), "Cache item added");

        if let Some(old) = &replaced {
            self.notify_removed(old, RemovalReason::Replaced);
        }
        for hooks in self.subscribers() {
            hooks.item_added(&self.name, &item);
        }
        Ok(item)
    }

    /// Typed convenience over [`add`](Self::add).
    ///
    /// # Errors
    ///
    /// See [`add`](Self::add).
    pub fn add_value<T: Any + Send + Sync>(
        &self,
        name: &str,
        value: T,
        delete_if_exists: bool,
    ) -> Result<CacheItem, CacheError> {
        self.add(name, Arc::new(value), delete_if_exists)
    }

    /// Looks `name` up, refreshing its age if the cache resets on read.
    ///
    /// On a miss each subscriber's `item_not_found` is asked in turn; the
    /// first value supplied is inserted and returned. Items past their
    /// maximum age stay visible until a sweep removes them.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the cache stays contended.
    pub fn get(&self, name: &str) -> Result<Option<CacheItem>, CacheError> {
        self.lookup(name, self.settings.reset_maximum_age)
    }

    /// Like [`get`](Self::get) but never refreshes the item's age.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the cache stays contended.
    pub fn get_ignoring_reset(&self, name: &str) -> Result<Option<CacheItem>, CacheError> {
        self.lookup(name, false)
    }

    /// Looks `name` up and downcasts its value.
    ///
    /// Returns `None` on a miss or if the value is not a `T`.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the cache stays contended.
    pub fn get_value<T: Any + Send + Sync>(&self, name: &str) -> Result<Option<Arc<T>>, CacheError> {
        Ok(self
            .get(name)?
            .and_then(|item| Arc::clone(item.value()).downcast::<T>().ok()))
    }

    /// Whether `name` is present. Does not consult subscribers or refresh age.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the cache stays contended.
    pub fn contains(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.lock_items()?.contains_key(name))
    }

    /// Number of items.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the cache stays contended.
    pub fn count(&self) -> Result<usize, CacheError> {
        Ok(self.lock_items()?.len())
    }

    /// Sorted item names.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the cache stays contended.
    pub fn names(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<String> = self.lock_items()?.keys().cloned().collect();
        names.sort_unstable();
        Ok(names)
    }

    /// Snapshot of every item.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the cache stays contended.
    pub fn items(&self) -> Result<Vec<CacheItem>, CacheError> {
        Ok(self.lock_items()?.values().cloned().collect())
    }

    /// Removes `name`, returning the item if it was present.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the cache stays contended.
    pub fn remove(&self, name: &str) -> Result<Option<CacheItem>, CacheError> {
        let removed = self.lock_items()?.remove(name);
        if let Some(item) = &removed {
            self.notify_removed(item, RemovalReason::Explicit);
        }
        Ok(removed)
    }

    /// Removes every item, returning how many. Does nothing and returns 0
    /// when the cache does not allow clearing.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the cache stays contended.
    pub fn clear(&self) -> Result<usize, CacheError> {
        if !self.settings.allow_clear_all {
            #[cfg(feature = "tracing")]
            debug!(cache = %self.name, "Clear ignored, cache does not allow clearing");
            return Ok(0);
        }

        let removed: Vec<CacheItem> = self.lock_items()?.drain().map(|(_, item)| item).collect();
        for item in &removed {
            self.notify_removed(item, RemovalReason::Cleared);
        }
        Ok(removed.len())
    }

    /// Evicts every item not refreshed within the maximum age, returning how many.
    ///
    /// # Errors
    ///
    /// [`CacheError::Lock`] if the cache stays contended.
    pub fn clean_cached_items(&self) -> Result<usize, CacheError> {
        let maximum_age = self.settings.maximum_age;
        let expired: Vec<CacheItem> = {
            let mut items = self.lock_items()?;
            let now = Instant::now();
            let names: Vec<String> = items
                .values()
                .filter(|item| item.is_expired_at(maximum_age, now))
                .map(|item| item.name().to_string())
                .collect();
            names.iter().filter_map(|name| items.remove(name)).collect()
        };

        let count = expired.len();
        if count > 0 {
            self.stats.evictions.fetch_add(count as u64, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_cache_evictions(count as u64);
            }

            #[cfg(feature = "tracing")]
            debug!(cache = %self.name, evicted = count, "Expired cache items evicted");
        }

        for item in &expired {
            self.notify_removed(item, RemovalReason::Expired);
        }
        Ok(count)
    }

    /// Counters since creation.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            lazy_loads: self.stats.lazy_loads.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            inserts: self.stats.inserts.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, name: &str, refresh: bool) -> Result<Option<CacheItem>, CacheError> {
        {
            let mut items = self.lock_items()?;
            if let Some(item) = items.get_mut(name) {
                if refresh {
                    item.touch();
                }
                let item = item.clone();
                drop(items);

                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_cache_hit();
                }
                return Ok(Some(item));
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_miss();
        }

        for hooks in self.subscribers() {
            if let Some(value) = hooks.item_not_found(&self.name, name) {
                self.stats.lazy_loads.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_cache_lazy_load();
                }

                // A concurrent insert of the same name wins; no duplicate
                return self.add(name, value, false).map(Some);
            }
        }
        Ok(None)
    }

    fn lock_items(&self) -> Result<TimedGuard<'_, ItemMap>, CacheError> {
        self.items
            .lock_with_retry(self.settings.lock_timeout, self.settings.lock_retries)
            .map_err(|err| {
                if err.is_timeout() {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_lock_timeout();
                    }
                }
                CacheError::from(err)
            })
    }

    // Cloned so subscribers can subscribe or unsubscribe from a callback
    fn subscribers(&self) -> Vec<Arc<dyn CacheHooks>> {
        self.subscribers.read().clone()
    }

    fn notify_removed(&self, item: &CacheItem, reason: RemovalReason) {
        for hooks in self.subscribers() {
            hooks.item_removed(&self.name, item, reason);
        }
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish()
    }
}
