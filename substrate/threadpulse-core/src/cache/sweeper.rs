//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Periodic expiry sweep, run as a supervised thread

#![forbid(unsafe_code)]

#[cfg(feature = "tracing")]
use tracing::{trace, warn};

use super::factory::CacheManagerFactory;
use crate::supervisor::{Worker, WorkerContext, WorkerError};

/// Calls [`CacheManagerFactory::clean_all_caches`] on every invocation
pub struct SweeperWorker {
    factory: CacheManagerFactory,
}

impl SweeperWorker {
    /// Sweeps `factory`.
    pub fn new(factory: CacheManagerFactory) -> Self {
        Self { factory }
    }
}

impl Worker for SweeperWorker {
    fn run(&mut self, _ctx: &WorkerContext) -> Result<bool, WorkerError> {
        match self.factory.clean_all_caches() {
            Ok(_evicted) => {
                #[cfg(feature = "tracing")]
                trace!(evicted = _evicted, "Cache sweep finished");
            }
            Err(_err) => {
                // Factory contention; next sweep retries
                #[cfg(feature = "tracing")]
                warn!(error = %_err, "Cache sweep skipped");
            }
        }
        Ok(true)
    }
}
