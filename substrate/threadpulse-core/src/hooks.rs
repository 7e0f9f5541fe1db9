//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Supervisor notifications: started, exited, exception, hung, cpu changed
#![forbid(unsafe_code)]
#![allow(clippy::inline_always)] /* Called on every supervised thread transition */

use crate::supervisor::{ExitReason, ThreadSnapshot, WorkerFailure};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// Observer of supervised thread lifecycle events.
///
/// Callbacks run on the thread that produced the event (the supervised thread
/// itself, or the watchdog for hang reports) and never while a registry lock
/// is held, so they may call back into the registry.
pub trait SupervisorHooks: Send + Sync {
    /// Called once the thread is running, before the first invocation.
    fn on_thread_started(&self, thread: &ThreadSnapshot);

    /// Called after the thread has left its run loop and deregistered.
    fn on_thread_exited(&self, thread: &ThreadSnapshot, reason: ExitReason);

    /// Called when an invocation returns an error or panics.
    fn on_exception(&self, thread: &ThreadSnapshot, failure: &WorkerFailure);

    /// Called once per invocation that exceeds its hang timeout.
    fn on_hung(&self, thread: &ThreadSnapshot, elapsed: Duration);

    /// Called when a thread's CPU share moves past its change threshold.
    fn on_cpu_changed(&self, thread: &ThreadSnapshot, process_usage: f64, system_usage: f64);
}

/// No-op hooks
#[derive(Debug, Default)]
pub struct NullHooks;

impl SupervisorHooks for NullHooks {
    #[inline(always)]
    fn on_thread_started(&self, _thread: &ThreadSnapshot) {}

    #[inline(always)]
    fn on_thread_exited(&self, _thread: &ThreadSnapshot, _reason: ExitReason) {}

    #[inline(always)]
    fn on_exception(&self, _thread: &ThreadSnapshot, _failure: &WorkerFailure) {}

    #[inline(always)]
    fn on_hung(&self, _thread: &ThreadSnapshot, _elapsed: Duration) {}

    #[inline(always)]
    fn on_cpu_changed(&self, _thread: &ThreadSnapshot, _process_usage: f64, _system_usage: f64) {}
}

/// Replaceable hook slot shared by the registry and its threads.
///
/// Dispatch isolates panics raised by the installed hooks so a faulty
/// observer cannot take down the thread that reported the event.
pub struct HookRegistry {
    hooks: RwLock<Option<Arc<dyn SupervisorHooks>>>,
}

impl HookRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(None),
        }
    }

    /// Installs `hooks`, returning the previous set.
    pub fn set_hooks(&self, hooks: Arc<dyn SupervisorHooks>) -> Option<Arc<dyn SupervisorHooks>> {
        self.hooks.write().replace(hooks)
    }

    /// Removes the installed hooks.
    pub fn clear_hooks(&self) -> Option<Arc<dyn SupervisorHooks>> {
        self.hooks.write().take()
    }

    /// Whether hooks are installed.
    #[inline]
    pub fn has_hooks(&self) -> bool {
        self.hooks.read().is_some()
    }

    // Cloned out so a callback can replace the hooks without deadlocking
    #[inline(always)]
    fn current(&self) -> Option<Arc<dyn SupervisorHooks>> {
        self.hooks.read().clone()
    }

    /* Dispatch helpers */

    // A panicking hook is logged and swallowed; the reporting thread carries on
    fn dispatch(&self, event: &'static str, call: impl FnOnce(&dyn SupervisorHooks)) {
        let Some(hooks) = self.current() else {
            return;
        };

        if catch_unwind(AssertUnwindSafe(|| call(hooks.as_ref()))).is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!(event, "Supervisor hook panicked");
            #[cfg(not(feature = "tracing"))]
            let _ = event;
        }
    }

    pub(crate) fn thread_started(&self, thread: &ThreadSnapshot) {
        self.dispatch("thread_started", |hooks| hooks.on_thread_started(thread));
    }

    pub(crate) fn thread_exited(&self, thread: &ThreadSnapshot, reason: ExitReason) {
        self.dispatch("thread_exited", |hooks| hooks.on_thread_exited(thread, reason));
    }

    pub(crate) fn exception(&self, thread: &ThreadSnapshot, failure: &WorkerFailure) {
        self.dispatch("exception", |hooks| hooks.on_exception(thread, failure));
    }

    pub(crate) fn hung(&self, thread: &ThreadSnapshot, elapsed: Duration) {
        self.dispatch("hung", |hooks| hooks.on_hung(thread, elapsed));
    }

    pub(crate) fn cpu_changed(&self, thread: &ThreadSnapshot, process_usage: f64, system_usage: f64) {
        self.dispatch("cpu_changed", |hooks| {
            hooks.on_cpu_changed(thread, process_usage, system_usage);
        });
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("installed", &self.has_hooks())
            .finish()
    }
}

/// Supervisor event delivered through [`ChannelHooks`]
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// Thread entered its run loop
    Started(ThreadSnapshot),
    /// Thread left its run loop
    Exited(ThreadSnapshot, ExitReason),
    /// An invocation failed
    Exception(ThreadSnapshot, WorkerFailure),
    /// An invocation exceeded its hang timeout
    Hung(ThreadSnapshot, Duration),
    /// CPU share crossed the change threshold
    CpuChanged {
        /// Thread state at the time of the change
        thread: ThreadSnapshot,
        /// Share of the process's CPU time, in percent
        process_usage: f64,
        /// Share of machine capacity, in percent
        system_usage: f64,
    },
}

impl SupervisorEvent {
    /// Thread the event describes.
    pub fn thread(&self) -> &ThreadSnapshot {
        match self {
            Self::Started(thread)
            | Self::Exited(thread, _)
            | Self::Exception(thread, _)
            | Self::Hung(thread, _)
            | Self::CpuChanged { thread, .. } => thread,
        }
    }
}

/// Hooks that forward every event into a crossbeam channel.
///
/// Events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelHooks {
    sender: Sender<SupervisorEvent>,
}

impl ChannelHooks {
    /// Creates hooks over an unbounded channel.
    #[must_use]
    pub fn unbounded() -> (Self, Receiver<SupervisorEvent>) {
        let (sender, receiver) = channel::unbounded();
        (Self { sender }, receiver)
    }

    /// Creates hooks over a bounded channel; events are dropped when full.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, Receiver<SupervisorEvent>) {
        let (sender, receiver) = channel::bounded(capacity);
        (Self { sender }, receiver)
    }

    fn send(&self, event: SupervisorEvent) {
        if let Err(_err) = self.sender.try_send(event) {
            #[cfg(feature = "tracing")]
            tracing::trace!(error = %_err, "Supervisor event dropped");
        }
    }
}

impl SupervisorHooks for ChannelHooks {
    fn on_thread_started(&self, thread: &ThreadSnapshot) {
        self.send(SupervisorEvent::Started(thread.clone()));
    }

    fn on_thread_exited(&self, thread: &ThreadSnapshot, reason: ExitReason) {
        self.send(SupervisorEvent::Exited(thread.clone(), reason));
    }

    fn on_exception(&self, thread: &ThreadSnapshot, failure: &WorkerFailure) {
        self.send(SupervisorEvent::Exception(thread.clone(), failure.clone()));
    }

    fn on_hung(&self, thread: &ThreadSnapshot, elapsed: Duration) {
        self.send(SupervisorEvent::Hung(thread.clone(), elapsed));
    }

    fn on_cpu_changed(&self, thread: &ThreadSnapshot, process_usage: f64, system_usage: f64) {
        self.send(SupervisorEvent::CpuChanged {
            thread: thread.clone(),
            process_usage,
            system_usage,
        });
    }
}
