//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Managed-thread supervisor
//!
//! Each [`ThreadManager`] runs one [`Worker`] on its own OS thread, invoking
//! it every `run_interval` until it returns `false`, fails, or is cancelled.
//! A [`ThreadRegistry`] keeps the named table of live instances, enforces the
//! running-thread limit and drives cancellation and hang detection.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use threadpulse_core::supervisor::{worker_fn, ThreadManager, ThreadRegistry, ThreadSettings};
//! use threadpulse_core::ThreadPriority;
//!
//! let registry = ThreadRegistry::default();
//! let manager = ThreadManager::new(
//!     worker_fn(|ctx| Ok(!ctx.has_cancelled())),
//!     ThreadSettings::every(Duration::from_millis(10)),
//! );
//!
//! registry.thread_start(&manager, "poller", ThreadPriority::Normal, false).unwrap();
//! assert!(registry.exists("poller").unwrap());
//!
//! assert_eq!(registry.cancel("poller").unwrap(), 1);
//! assert!(!registry.exists("poller").unwrap());
//! ```

#![forbid(unsafe_code)]

mod cancel;
mod manager;
mod registry;
mod watchdog;
mod worker;

pub use cancel::CancellationToken;
pub use manager::{
    ExitReason, ThreadManager, ThreadSettings, ThreadSnapshot, ThreadState, WorkerFailure,
    DEFAULT_CPU_CHANGE_THRESHOLD, DEFAULT_RUN_INTERVAL,
};
pub use registry::ThreadRegistry;
pub use watchdog::WatchdogWorker;
pub use worker::{worker_fn, AbortHook, FnWorker, Worker, WorkerContext, WorkerError};

use crate::lock::LockError;
use thiserror::Error;

/// Errors raised by the supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Thread names must contain a non-whitespace character
    #[error("thread name must not be empty")]
    InvalidName,

    /// A live instance already uses the name
    #[error("a thread named `{0}` is already running")]
    DuplicateName(String),

    /// The instance was started or cancelled before
    #[error("thread manager {0} was already started or cancelled")]
    AlreadyStarted(u64),

    /// Starting would exceed the running-thread limit
    #[error("running thread limit of {limit} reached")]
    ThreadLimitReached {
        /// Configured maximum
        limit: usize,
    },

    /// The registry has been finalised
    #[error("thread registry has been shut down")]
    ShutDown,

    /// The OS refused to create the thread
    #[error("failed to spawn thread `{name}`: {source}")]
    Spawn {
        /// Requested thread name
        name: String,
        /// OS error
        #[source]
        source: std::io::Error,
    },

    /// The registry table stayed locked
    #[error(transparent)]
    Lock(#[from] LockError),
}
