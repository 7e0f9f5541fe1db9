//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Named, timestamped cache entry

#![forbid(unsafe_code)]

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Type-erased value stored in a cache
pub type CacheValue = Arc<dyn Any + Send + Sync>;

/// Single cached value.
///
/// Items handed out by a cache are snapshots: the value is shared through its
/// `Arc`, the timestamps are copies taken at lookup time.
#[derive(Clone)]
pub struct CacheItem {
    name: String,
    value: CacheValue,
    created: Instant,
    last_updated: Instant,
}

impl CacheItem {
    pub(crate) fn new(name: String, value: CacheValue) -> Self {
        let now = Instant::now();
        Self {
            name,
            value,
            created: now,
            last_updated: now,
        }
    }

    /// Key within the owning cache.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stored value.
    pub fn value(&self) -> &CacheValue {
        &self.value
    }

    /// The stored value as `T`, if it is one.
    pub fn value_as<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// When the item was inserted.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// When the item was inserted or last refreshed by a read.
    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    /// Time since the last refresh.
    pub fn age(&self) -> Duration {
        self.last_updated.elapsed()
    }

    /// Whether the item is older than `maximum_age` at `now`.
    pub fn is_expired_at(&self, maximum_age: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_updated) > maximum_age
    }

    pub(crate) fn touch(&mut self) {
        self.last_updated = Instant::now();
    }
}

impl fmt::Debug for CacheItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheItem")
            .field("name", &self.name)
            .field("created", &self.created)
            .field("last_updated", &self.last_updated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let item = CacheItem::new("answer".into(), Arc::new(42u32));
        assert_eq!(item.value_as::<u32>(), Some(&42));
        assert!(item.value_as::<String>().is_none());
        assert_eq!(item.created(), item.last_updated());
    }

    #[test]
    fn test_touch_keeps_created() {
        let mut item = CacheItem::new("t".into(), Arc::new(()));
        let created = item.created();
        std::thread::sleep(Duration::from_millis(2));
        item.touch();

        assert_eq!(item.created(), created);
        assert!(item.last_updated() > created);
    }

    #[test]
    fn test_expiry() {
        let item = CacheItem::new("e".into(), Arc::new(()));
        let later = item.last_updated() + Duration::from_millis(50);

        assert!(!item.is_expired_at(Duration::from_millis(50), later));
        assert!(item.is_expired_at(Duration::from_millis(49), later));
    }
}
