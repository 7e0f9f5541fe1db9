//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Hang detection sweep, run as a supervised thread

#![forbid(unsafe_code)]

use std::sync::Weak;

#[cfg(feature = "tracing")]
use tracing::warn;

use super::registry::{RegistryShared, ThreadRegistry};
use super::worker::{Worker, WorkerContext, WorkerError};

/// Sweeps the registry for overrunning invocations.
///
/// Holds the registry weakly so a registry dropped without finalising does
/// not stay alive through its own watchdog; the worker finishes once the
/// registry is gone.
pub struct WatchdogWorker {
    registry: Weak<RegistryShared>,
}

impl WatchdogWorker {
    pub(crate) fn new(registry: Weak<RegistryShared>) -> Self {
        Self { registry }
    }
}

impl Worker for WatchdogWorker {
    fn run(&mut self, _ctx: &WorkerContext) -> Result<bool, WorkerError> {
        let Some(shared) = self.registry.upgrade() else {
            return Ok(false);
        };

        // Contention is transient; try again next sweep
        if let Err(_err) = ThreadRegistry::from_shared(shared).check_hung() {
            #[cfg(feature = "tracing")]
            warn!(error = %_err, "Watchdog sweep skipped");
        }
        Ok(true)
    }
}
