//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! threadpulse: supervised threads, bounded-wait locks and age-evicting caches
//!
//! This crate bundles the pieces a long-running service needs to keep its
//! background work observable and contained.
//!
//! # Features
//!
//! - **Supervised threads**: one OS thread per unit of repeatable work, with a
//!   named registry, cooperative cancellation, abort hooks and hang detection
//! - **Bounded-wait locks**: `TimedLock` never blocks forever and refuses
//!   re-entry from the holding thread
//! - **Age-evicting caches**: named caches of type-erased values with
//!   add/remove notifications and lazy population on miss
//! - **CPU accounting**: per-thread share of process and machine CPU on
//!   Linux, Windows and macOS
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use threadpulse::prelude::*;
//!
//! let config = SubstrateConfig::builder()
//!     .sweep_interval(Duration::from_millis(50))
//!     .build()
//!     .unwrap();
//! let substrate = Substrate::initialise(config).unwrap();
//!
//! let sessions = substrate.caches().create_cache("sessions", Duration::from_secs(60)).unwrap();
//! sessions.add_value("alice", 42u64, false).unwrap();
//!
//! let poller = ThreadManager::new(
//!     worker_fn(|ctx| Ok(!ctx.has_cancelled())),
//!     ThreadSettings::every(Duration::from_millis(10)),
//! );
//! substrate.registry().thread_start(&poller, "poller", ThreadPriority::Normal, false).unwrap();
//!
//! substrate.finalise().unwrap();
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use threadpulse_core::*;

/// Types most programs need
pub mod prelude {
    pub use threadpulse_core::{
        worker_fn, CacheError, CacheHooks, CacheManager, CacheManagerFactory, CacheSettings, CacheValue,
        CancellationToken, ExitReason, Loader, LockError, Substrate, SubstrateConfig, SupervisorError,
        SupervisorHooks, ThreadManager, ThreadPriority, ThreadRegistry, ThreadSettings, TimedLock, Worker,
        WorkerContext, WorkerError,
    };
}
