//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Time-based eviction cache
//!
//! A [`CacheManager`] maps names to type-erased [`CacheItem`]s. Items older
//! than the cache's maximum age are removed by [`CacheManager::clean_cached_items`],
//! normally driven for every cache at once by a [`SweeperWorker`] thread.
//! Subscribers ([`CacheHooks`]) hear about additions and removals and get one
//! synchronous chance to fill a miss.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use threadpulse_core::cache::{CacheManagerFactory, CacheValue, Loader};
//!
//! let factory = CacheManagerFactory::default();
//! let errors = factory.create_cache("errors", Duration::from_secs(300)).unwrap();
//!
//! errors.add_value("disk-full", 1u32, false).unwrap();
//! assert_eq!(errors.get_value::<u32>("disk-full").unwrap().as_deref(), Some(&1));
//!
//! errors.subscribe(Arc::new(Loader::new(|name: &str| {
//!     Some(Arc::new(name.len() as u32) as CacheValue)
//! })));
//! assert!(errors.get("timeout").unwrap().is_some());
//! ```

#![forbid(unsafe_code)]

mod events;
mod factory;
mod item;
mod manager;
mod sweeper;

pub use events::{CacheHooks, Loader, RemovalReason};
pub use factory::CacheManagerFactory;
pub use item::{CacheItem, CacheValue};
pub use manager::{CacheManager, CacheSettings, CacheStats};
pub use sweeper::SweeperWorker;

use crate::lock::LockError;
use thiserror::Error;

/// Errors raised by caches and the cache factory
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Names must contain a non-whitespace character
    #[error("cache or item name must not be empty")]
    InvalidName,

    /// A cache with the name already exists
    #[error("cache `{0}` already exists")]
    AlreadyExists(String),

    /// No cache with the name exists
    #[error("cache `{0}` does not exist")]
    NotFound(String),

    /// The cache or factory stayed locked
    #[error(transparent)]
    Lock(#[from] LockError),
}
