//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Cache notifications and the lazy-population hook
#![forbid(unsafe_code)]

use super::item::{CacheItem, CacheValue};

/// Why an item left a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    /// Removed by name
    Explicit,
    /// Evicted by an age sweep
    Expired,
    /// Removed by a clear
    Cleared,
    /// Overwritten by an add with replacement
    Replaced,
}

/// Subscriber to a cache's events.
///
/// Every method has a no-op default. Calls happen after the cache lock is
/// released, on the thread that performed the operation.
pub trait CacheHooks: Send + Sync {
    /// An item was inserted.
    fn item_added(&self, _cache: &str, _item: &CacheItem) {}

    /// An item left the cache.
    fn item_removed(&self, _cache: &str, _item: &CacheItem, _reason: RemovalReason) {}

    /// A lookup missed. Returning a value inserts it and answers the lookup;
    /// subscribers are asked in order and the first value wins.
    fn item_not_found(&self, _cache: &str, _name: &str) -> Option<CacheValue> {
        None
    }
}

/// [`CacheHooks`] that fills misses from a closure
pub struct Loader<F> {
    load: F,
}

impl<F> Loader<F>
where
    F: Fn(&str) -> Option<CacheValue> + Send + Sync,
{
    /// Wraps `load`, which receives the missing item name.
    pub fn new(load: F) -> Self {
        Self { load }
    }
}

impl<F> CacheHooks for Loader<F>
where
    F: Fn(&str) -> Option<CacheValue> + Send + Sync,
{
    fn item_not_found(&self, _cache: &str, name: &str) -> Option<CacheValue> {
        (self.load)(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Silent;
    impl CacheHooks for Silent {}

    #[test]
    fn test_defaults_do_nothing() {
        let hooks = Silent;
        let item = CacheItem::new("x".into(), Arc::new(1u8));
        hooks.item_added("c", &item);
        hooks.item_removed("c", &item, RemovalReason::Explicit);
        assert!(hooks.item_not_found("c", "x").is_none());
    }

    #[test]
    fn test_loader() {
        let loader = Loader::new(|name: &str| {
            (name == "known").then(|| Arc::new(name.len()) as CacheValue)
        });
        let value = loader.item_not_found("c", "known").unwrap();
        assert_eq!(value.downcast_ref::<usize>(), Some(&5));
        assert!(loader.item_not_found("c", "other").is_none());
    }
}
