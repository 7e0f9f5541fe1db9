//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Units of repeatable work run by a supervised thread

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use super::cancel::CancellationToken;

/// Error returned by a failed invocation
pub type WorkerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback run synchronously before a thread's token is cancelled
pub type AbortHook = Arc<dyn Fn() + Send + Sync>;

/// Work invoked repeatedly on a dedicated thread.
///
/// `run` returns `Ok(true)` to be called again after the run interval and
/// `Ok(false)` to finish. Errors and panics are reported as failures.
pub trait Worker: Send + 'static {
    /// Performs one invocation.
    ///
    /// # Errors
    ///
    /// Any error ends the thread and is reported through the exception hook.
    fn run(&mut self, ctx: &WorkerContext) -> Result<bool, WorkerError>;

    /// Hook invoked before cancellation is signalled, e.g. to send a close
    /// notice on a socket the worker is blocked on.
    fn abort_hook(&self) -> Option<AbortHook> {
        None
    }
}

/// What an invocation can see of its supervisor
#[derive(Debug, Clone)]
pub struct WorkerContext {
    name: String,
    id: u64,
    token: CancellationToken,
}

impl WorkerContext {
    pub(crate) fn new(name: String, id: u64, token: CancellationToken) -> Self {
        Self { name, id, token }
    }

    /// Registered thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Internal instance id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the thread has been asked to stop.
    pub fn has_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Interruptible sleep; returns `true` if cancelled meanwhile.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.token.wait(timeout)
    }

    /// The thread's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// [`Worker`] backed by a closure
pub struct FnWorker<F> {
    func: F,
    abort: Option<AbortHook>,
}

impl<F> FnWorker<F>
where
    F: FnMut(&WorkerContext) -> Result<bool, WorkerError> + Send + 'static,
{
    /// Wraps `func`.
    pub fn new(func: F) -> Self {
        Self { func, abort: None }
    }

    /// Attaches an abort hook.
    #[must_use]
    pub fn with_abort_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.abort = Some(Arc::new(hook));
        self
    }
}

impl<F> Worker for FnWorker<F>
where
    F: FnMut(&WorkerContext) -> Result<bool, WorkerError> + Send + 'static,
{
    fn run(&mut self, ctx: &WorkerContext) -> Result<bool, WorkerError> {
        (self.func)(ctx)
    }

    fn abort_hook(&self) -> Option<AbortHook> {
        self.abort.clone()
    }
}

/// Shorthand for [`FnWorker::new`].
pub fn worker_fn<F>(func: F) -> FnWorker<F>
where
    F: FnMut(&WorkerContext) -> Result<bool, WorkerError> + Send + 'static,
{
    FnWorker::new(func)
}
