//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Named table of supervised threads and their run loop

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

#[cfg(feature = "tracing")]
use tracing::{debug, error, info, warn};

use super::manager::{ExitReason, ThreadManager, ThreadSnapshot, WorkerFailure};
use super::watchdog::WatchdogWorker;
use super::worker::{Worker, WorkerContext};
use super::SupervisorError;
use crate::accounting::CpuUsageCollector;
use crate::config::RegistryConfig;
use crate::hooks::HookRegistry;
use crate::lock::{TimedGuard, TimedLock};
use crate::metrics::SubstrateMetrics;
use crate::os_thread::{self, ThreadPriority};
use crate::timing::create_cpu_timer;

type ThreadTable = HashMap<u64, Arc<ThreadManager>>;

pub(crate) struct RegistryShared {
    table: TimedLock<ThreadTable>,
    config: RegistryConfig,
    hooks: Arc<HookRegistry>,
    metrics: Arc<SubstrateMetrics>,
    collector: RwLock<Option<Arc<dyn CpuUsageCollector>>>,
    shut_down: AtomicBool,
}

/// Registry of live supervised threads.
///
/// Cloning is cheap and every clone refers to the same table. An entry exists
/// from a successful [`thread_start`](Self::thread_start) until the thread
/// leaves its run loop or is cancelled through the registry.
#[derive(Clone)]
pub struct ThreadRegistry {
    shared: Arc<RegistryShared>,
}

impl ThreadRegistry {
    /// Creates a registry.
    pub fn new(config: RegistryConfig, hooks: Arc<HookRegistry>, metrics: Arc<SubstrateMetrics>) -> Self {
        let table = TimedLock::with_timeout("thread-registry", HashMap::new(), config.lock_timeout);
        Self {
            shared: Arc::new(RegistryShared {
                table,
                config,
                hooks,
                metrics,
                collector: RwLock::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<RegistryShared>) -> Self {
        Self { shared }
    }

    /// Registry settings.
    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// Hooks notified of thread events.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.shared.hooks
    }

    /// Shared counters.
    pub fn metrics(&self) -> &Arc<SubstrateMetrics> {
        &self.shared.metrics
    }

    /// Routes CPU accounting of threads started from now on through `collector`.
    pub fn attach_collector(&self, collector: Arc<dyn CpuUsageCollector>) {
        *self.shared.collector.write() = Some(collector);
    }

    /// Detaches the CPU collector.
    pub fn detach_collector(&self) -> Option<Arc<dyn CpuUsageCollector>> {
        self.shared.collector.write().take()
    }

    /// The attached CPU collector.
    pub fn collector(&self) -> Option<Arc<dyn CpuUsageCollector>> {
        self.shared.collector.read().clone()
    }

    /// Worker that runs [`check_hung`](Self::check_hung) until the registry is dropped.
    pub fn watchdog(&self) -> WatchdogWorker {
        WatchdogWorker::new(Arc::downgrade(&self.shared))
    }

    /// Whether [`finalise`](Self::finalise) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    /// Registers `manager` under `name` and starts its thread.
    ///
    /// Surrounding whitespace is trimmed from `name` here and in every
    /// lookup by name.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::InvalidName`] for an empty name
    /// - [`SupervisorError::ShutDown`] after [`finalise`](Self::finalise)
    /// - [`SupervisorError::DuplicateName`] if a live instance has the name and
    ///   `allow_multiple` is false
    /// - [`SupervisorError::ThreadLimitReached`] at `max_running_threads`
    /// - [`SupervisorError::AlreadyStarted`] if `manager` ran before
    /// - [`SupervisorError::Spawn`] if the OS refuses the thread
    /// - [`SupervisorError::Lock`] if the table stays contended
    ///
    /// Nothing is registered when an error is returned.
    pub fn thread_start(
        &self,
        manager: &Arc<ThreadManager>,
        name: &str,
        priority: ThreadPriority,
        allow_multiple: bool,
    ) -> Result<(), SupervisorError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SupervisorError::InvalidName);
        }

        let worker = {
            let mut table = self.shared.table()?;

            if self.is_shut_down() {
                return Err(SupervisorError::ShutDown);
            }
            if !allow_multiple && table.values().any(|m| m.name() == Some(name)) {
                return Err(SupervisorError::DuplicateName(name.to_string()));
            }
            let limit = self.shared.config.max_running_threads;
            if table.len() >= limit {
                #[cfg(feature = "tracing")]
                warn!(name, limit, "Thread start rejected: running thread limit reached");
                return Err(SupervisorError::ThreadLimitReached { limit });
            }

            let worker = manager.prepare_start(name, priority)?;
            table.insert(manager.id(), Arc::clone(manager));
            worker
        };

        let mut builder = thread::Builder::new().name(name.to_string());
        if let Some(stack_size) = manager.settings().stack_size {
            builder = builder.stack_size(stack_size);
        }

        let shared = Arc::clone(&self.shared);
        let thread_manager = Arc::clone(manager);
        match builder.spawn(move || supervise(&shared, &thread_manager, worker)) {
            Ok(handle) => {
                manager.attach_handle(handle);

                #[cfg(feature = "tracing")]
                info!(name, id = manager.id(), %priority, "Supervised thread started");

                Ok(())
            }
            Err(source) => {
                manager.spawn_failed();
                self.shared.deregister(manager);

                #[cfg(feature = "tracing")]
                error!(name, error = %source, "Failed to spawn supervised thread");

                Err(SupervisorError::Spawn {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Whether a live instance is registered under `name`.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Lock`] if the table stays contended.
    pub fn exists(&self, name: &str) -> Result<bool, SupervisorError> {
        let name = name.trim();
        let table = self.shared.table()?;
        Ok(table.values().any(|m| m.name() == Some(name)))
    }

    /// First live instance registered under `name`.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Lock`] if the table stays contended.
    pub fn get(&self, name: &str) -> Result<Option<Arc<ThreadManager>>, SupervisorError> {
        let name = name.trim();
        let table = self.shared.table()?;
        Ok(table.values().find(|m| m.name() == Some(name)).cloned())
    }

    /// Names of live instances, sorted, duplicates kept.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Lock`] if the table stays contended.
    pub fn names(&self) -> Result<Vec<String>, SupervisorError> {
        let table = self.shared.table()?;
        let mut names: Vec<String> = table.values().filter_map(|m| m.name().map(str::to_string)).collect();
        names.sort_unstable();
        Ok(names)
    }

    /// Number of live instances.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Lock`] if the table stays contended.
    pub fn count(&self) -> Result<usize, SupervisorError> {
        Ok(self.shared.table()?.len())
    }

    /// Snapshots of every live instance.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Lock`] if the table stays contended.
    pub fn snapshots(&self) -> Result<Vec<ThreadSnapshot>, SupervisorError> {
        Ok(self.shared.live()?.iter().map(|m| m.snapshot()).collect())
    }

    /// Cancels every live instance named `name`, waits for each to exit
    /// (up to `join_timeout`) and deregisters them.
    ///
    /// Returns how many instances were cancelled; zero if none matched.
    /// Called from one of the targeted threads, that thread is not joined.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Lock`] if the table stays contended.
    pub fn cancel(&self, name: &str) -> Result<usize, SupervisorError> {
        let name = name.trim();
        let targets: Vec<Arc<ThreadManager>> = {
            let table = self.shared.table()?;
            table.values().filter(|m| m.name() == Some(name)).cloned().collect()
        };
        self.cancel_instances(targets)
    }

    /// Cancels and deregisters every live instance.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Lock`] if the table stays contended.
    pub fn cancel_all(&self) -> Result<usize, SupervisorError> {
        let targets = self.shared.live()?;
        self.cancel_instances(targets)
    }

    /// Rejects further starts and cancels every live instance. Idempotent.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Lock`] if the table stays contended.
    pub fn finalise(&self) -> Result<usize, SupervisorError> {
        if !self.shared.shut_down.swap(true, Ordering::AcqRel) {
            #[cfg(feature = "tracing")]
            info!("Finalising thread registry");
        }
        self.cancel_all()
    }

    /// Flags every live instance whose current invocation has overrun its
    /// hang timeout. Returns how many were newly flagged.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Lock`] if the table stays contended.
    pub fn check_hung(&self) -> Result<usize, SupervisorError> {
        let mut flagged = 0;
        for manager in self.shared.live()? {
            if let Some(elapsed) = manager.check_hang() {
                self.shared.report_hang(&manager, elapsed);
                flagged += 1;
            }
        }
        Ok(flagged)
    }

    fn cancel_instances(&self, targets: Vec<Arc<ThreadManager>>) -> Result<usize, SupervisorError> {
        if targets.is_empty() {
            return Ok(0);
        }

        // Signal everyone first so threads wind down in parallel
        for manager in &targets {
            manager.cancel();
            self.shared.metrics.record_thread_cancelled();
        }

        let join_timeout = self.shared.config.join_timeout;
        for manager in &targets {
            if manager.is_current_thread() {
                continue;
            }
            if !manager.join(join_timeout) {
                #[cfg(feature = "tracing")]
                warn!(
                    name = ?manager.name(),
                    id = manager.id(),
                    timeout_ms = join_timeout.as_millis() as u64,
                    "Cancelled thread did not exit in time, detaching"
                );
            }
        }

        let mut table = self.shared.table()?;
        for manager in &targets {
            remove_entry(&mut table, manager);
        }
        Ok(targets.len())
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new(
            RegistryConfig::default(),
            Arc::new(HookRegistry::new()),
            Arc::new(SubstrateMetrics::new()),
        )
    }
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("config", &self.shared.config)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl RegistryShared {
    fn table(&self) -> Result<TimedGuard<'_, ThreadTable>, SupervisorError> {
        self.table
            .lock_with_retry(self.config.lock_timeout, self.config.lock_retries)
            .map_err(|err| {
                if err.is_timeout() {
                    self.metrics.record_lock_timeout();
                }
                SupervisorError::from(err)
            })
    }

    fn live(&self) -> Result<Vec<Arc<ThreadManager>>, SupervisorError> {
        Ok(self.table()?.values().cloned().collect())
    }

    fn deregister(&self, manager: &Arc<ThreadManager>) {
        match self.table() {
            Ok(mut table) => remove_entry(&mut table, manager),
            Err(_err) => {
                #[cfg(feature = "tracing")]
                error!(id = manager.id(), error = %_err, "Could not deregister exiting thread");
            }
        }
    }

    fn report_hang(&self, manager: &ThreadManager, elapsed: Duration) {
        self.metrics.record_hang_detected();

        #[cfg(feature = "tracing")]
        warn!(
            name = ?manager.name(),
            id = manager.id(),
            elapsed_ms = elapsed.as_millis() as u64,
            hang_timeout_ms = manager.settings().hang_timeout.as_millis() as u64,
            "Supervised thread invocation is hung"
        );

        self.hooks.hung(&manager.snapshot(), elapsed);
    }

    fn collector(&self) -> Option<Arc<dyn CpuUsageCollector>> {
        self.collector.read().clone()
    }
}

fn remove_entry(table: &mut ThreadTable, manager: &Arc<ThreadManager>) {
    if table.get(&manager.id()).is_some_and(|entry| Arc::ptr_eq(entry, manager)) {
        table.remove(&manager.id());
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/* Body of every supervised thread */
fn supervise(shared: &Arc<RegistryShared>, manager: &Arc<ThreadManager>, mut worker: Box<dyn Worker>) {
    manager.enter_thread();
    let name = manager.name().unwrap_or_default().to_string();
    let settings = manager.settings().clone();

    let priority = manager.priority();
    if priority != ThreadPriority::Normal {
        if let Err(_err) = os_thread::set_current_thread_priority(priority) {
            #[cfg(feature = "tracing")]
            debug!(name = %name, error = %_err, "Thread priority not applied");
        }
    }

    let collector = shared.collector();
    let timer = collector.as_ref().map(|_| create_cpu_timer());
    if let Some(collector) = &collector {
        collector.thread_add(manager);
    }

    shared.metrics.record_thread_started(&name);
    shared.hooks.thread_started(&manager.snapshot());

    let ctx = WorkerContext::new(name.clone(), manager.id(), manager.token().clone());
    let reason = loop {
        if manager.has_cancelled() {
            break ExitReason::Cancelled;
        }

        manager.begin_invocation();
        let outcome = catch_unwind(AssertUnwindSafe(|| worker.run(&ctx)));
        if let Some(elapsed) = manager.end_invocation() {
            shared.report_hang(manager, elapsed);
        }

        if let Some(timer) = &timer {
            if let Ok(nanos) = timer.thread_cpu_time_ns() {
                manager.record_thread_cpu(nanos);
            }
        }

        let failure = match outcome {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) if manager.cancel_requested() => break ExitReason::Cancelled,
            Ok(Ok(false)) => break ExitReason::Completed,
            Ok(Err(err)) => Some(WorkerFailure::Error(err.to_string())),
            Err(payload) => Some(WorkerFailure::Panicked(panic_message(payload.as_ref()))),
        };

        if let Some(failure) = failure {
            manager.record_failure(failure.clone());
            shared.metrics.record_worker_failure();
            shared.hooks.exception(&manager.snapshot(), &failure);

            if !settings.continue_on_error {
                #[cfg(feature = "tracing")]
                error!(name = %name, %failure, "Unhandled worker failure, aborting process");
                #[cfg(not(feature = "tracing"))]
                eprintln!("threadpulse: unhandled failure in `{name}`: {failure}, aborting process");

                std::process::abort();
            }

            #[cfg(feature = "tracing")]
            error!(name = %name, %failure, "Supervised thread failed, stopping it");

            break ExitReason::Failed;
        }

        if manager.token().wait(settings.run_interval) {
            break ExitReason::Cancelled;
        }
    };

    manager.finish(reason);
    shared.deregister(manager);
    if let Some(collector) = &collector {
        collector.thread_remove(manager);
    }

    let run_time = manager.started_at().map(|at| at.elapsed()).unwrap_or_default();
    shared.metrics.record_thread_exited(run_time);

    #[cfg(feature = "tracing")]
    debug!(name = %name, ?reason, runs = manager.run_count(), "Supervised thread exited");

    shared.hooks.thread_exited(&manager.snapshot(), reason);
    manager.signal_exit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{worker_fn, ThreadSettings, ThreadState};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn fast() -> ThreadSettings {
        ThreadSettings::every(Duration::from_millis(5))
    }

    fn looping() -> Arc<ThreadManager> {
        ThreadManager::new(worker_fn(|_| Ok(true)), fast())
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_start_and_cancel() {
        let registry = ThreadRegistry::default();
        let manager = looping();

        assert!(!registry.exists("worker").unwrap());
        registry.thread_start(&manager, "worker", ThreadPriority::Normal, false).unwrap();
        assert!(registry.exists("worker").unwrap());
        assert_eq!(registry.count().unwrap(), 1);
        assert!(wait_until(Duration::from_secs(2), || manager.run_count() > 0));

        assert_eq!(registry.cancel("worker").unwrap(), 1);
        assert!(!registry.exists("worker").unwrap());
        assert_eq!(manager.state(), ThreadState::Cancelled);
        assert_eq!(registry.cancel("worker").unwrap(), 0);
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = ThreadRegistry::default();
        let err = registry.thread_start(&looping(), "  ", ThreadPriority::Normal, false).unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidName));
    }

    #[test]
    fn test_names_are_trimmed_in_lookups() {
        let registry = ThreadRegistry::default();
        let manager = looping();

        registry.thread_start(&manager, " padded ", ThreadPriority::Normal, false).unwrap();
        assert_eq!(manager.name(), Some("padded"));
        assert!(registry.exists(" padded ").unwrap());
        assert!(registry.exists("padded").unwrap());
        assert!(registry.get(" padded ").unwrap().is_some());

        let err = registry.thread_start(&looping(), "padded  ", ThreadPriority::Normal, false).unwrap_err();
        assert!(matches!(err, SupervisorError::DuplicateName(ref n) if n == "padded"));

        assert_eq!(registry.cancel(" padded ").unwrap(), 1);
        assert!(!registry.exists("padded").unwrap());
    }

    #[test]
    fn test_duplicate_name_rejected_unless_allowed() {
        let registry = ThreadRegistry::default();
        let first = looping();
        let second = looping();
        let third = looping();

        registry.thread_start(&first, "dup", ThreadPriority::Normal, false).unwrap();
        let err = registry.thread_start(&second, "dup", ThreadPriority::Normal, false).unwrap_err();
        assert!(matches!(err, SupervisorError::DuplicateName(ref n) if n == "dup"));
        assert_eq!(second.state(), ThreadState::Created);

        registry.thread_start(&third, "dup", ThreadPriority::Normal, true).unwrap();
        assert_eq!(registry.names().unwrap(), vec!["dup".to_string(), "dup".to_string()]);

        assert_eq!(registry.cancel("dup").unwrap(), 2);
        assert_eq!(registry.count().unwrap(), 0);
    }

    #[test]
    fn test_restart_rejected() {
        let registry = ThreadRegistry::default();
        let manager = looping();
        registry.thread_start(&manager, "once", ThreadPriority::Normal, false).unwrap();
        registry.cancel("once").unwrap();

        let err = registry.thread_start(&manager, "once", ThreadPriority::Normal, false).unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyStarted(_)));
        assert!(!registry.exists("once").unwrap());
    }

    #[test]
    fn test_completed_worker_deregisters() {
        let registry = ThreadRegistry::default();
        let manager = ThreadManager::new(worker_fn(|_| Ok(false)), fast());

        registry.thread_start(&manager, "one-shot", ThreadPriority::Normal, false).unwrap();
        assert!(manager.join(Duration::from_secs(5)));
        assert_eq!(manager.state(), ThreadState::Finished);
        assert_eq!(manager.run_count(), 1);
        assert!(!registry.exists("one-shot").unwrap());
    }

    #[test]
    fn test_self_cancel_does_not_deadlock() {
        let registry = ThreadRegistry::default();
        let inner = registry.clone();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let manager = ThreadManager::new(
            worker_fn({
                let cancelled = Arc::clone(&cancelled);
                move |ctx| {
                    let count = inner.cancel(ctx.name()).map_err(|e| e.to_string())?;
                    cancelled.store(count, Ordering::SeqCst);
                    Ok(true)
                }
            }),
            fast(),
        );

        registry.thread_start(&manager, "self-cancel", ThreadPriority::Normal, false).unwrap();
        assert!(manager.join(Duration::from_secs(5)));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ThreadState::Cancelled);
        assert!(!registry.exists("self-cancel").unwrap());
    }

    #[test]
    fn test_finalise_rejects_new_threads() {
        let registry = ThreadRegistry::default();
        registry.thread_start(&looping(), "a", ThreadPriority::Normal, false).unwrap();
        registry.thread_start(&looping(), "b", ThreadPriority::Normal, false).unwrap();

        assert_eq!(registry.finalise().unwrap(), 2);
        assert_eq!(registry.finalise().unwrap(), 0);
        assert!(registry.is_shut_down());

        let err = registry.thread_start(&looping(), "c", ThreadPriority::Normal, false).unwrap_err();
        assert!(matches!(err, SupervisorError::ShutDown));
    }

    #[test]
    fn test_check_hung_flags_slow_invocation() {
        let registry = ThreadRegistry::default();
        let manager = ThreadManager::new(
            worker_fn(|ctx| {
                ctx.wait(Duration::from_millis(300));
                Ok(true)
            }),
            fast().hang_timeout(Duration::from_millis(20)),
        );

        registry.thread_start(&manager, "slow", ThreadPriority::Normal, false).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            registry.check_hung().unwrap() > 0 || manager.is_hung()
        }));
        assert!(manager.hang_detections() >= 1);
        assert!(registry.metrics().snapshot().hang_detections >= 1);

        registry.cancel("slow").unwrap();
    }

    #[test]
    fn test_snapshots() {
        let registry = ThreadRegistry::default();
        let manager = looping();
        registry.thread_start(&manager, "snap", ThreadPriority::BelowNormal, false).unwrap();

        let snapshots = registry.snapshots().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name.as_deref(), Some("snap"));
        assert_eq!(snapshots[0].priority, ThreadPriority::BelowNormal);
        assert_eq!(registry.get("snap").unwrap().unwrap().id(), manager.id());
        assert!(registry.get("nope").unwrap().is_none());

        registry.cancel_all().unwrap();
    }
}
