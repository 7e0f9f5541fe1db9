//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Supervised unit of repeatable work
//!
//! A [`ThreadManager`] owns one [`Worker`] and the bookkeeping around it:
//! lifecycle state, cancellation token, hang detection and CPU share. The
//! registry gives it a dedicated OS thread; everything here is safe to read
//! from any thread while that thread runs.

#![forbid(unsafe_code)]

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use super::cancel::CancellationToken;
use super::worker::{AbortHook, Worker};
use super::SupervisorError;
use crate::accounting::percent_of;
use crate::os_thread::{self, ThreadPriority};

/// Default delay between invocations
pub const DEFAULT_RUN_INTERVAL: Duration = Duration::from_secs(1);

/// Default CPU share movement, in percentage points, that raises a change notification
pub const DEFAULT_CPU_CHANGE_THRESHOLD: f64 = 5.0;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`ThreadManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    /// Constructed, not yet started
    Created = 0,
    /// Thread spawned and looping
    Running = 1,
    /// Cancellation requested, loop not yet exited
    Cancelling = 2,
    /// Exited after cancellation
    Cancelled = 3,
    /// Worker returned `false`
    Finished = 4,
    /// Worker failed or the thread could not be spawned
    Failed = 5,
}

impl ThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Cancelling,
            3 => Self::Cancelled,
            4 => Self::Finished,
            _ => Self::Failed,
        }
    }

    /// Whether the thread has left its run loop for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Finished | Self::Failed)
    }
}

/// Why a supervised thread left its run loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    /// The worker returned `Ok(false)`
    Completed,
    /// Cancellation was observed
    Cancelled,
    /// An invocation returned an error or panicked
    Failed,
}

/// Failure of a single invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerFailure {
    /// The worker returned `Err`
    Error(String),
    /// The worker panicked
    Panicked(String),
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(message) => write!(f, "worker error: {message}"),
            Self::Panicked(message) => write!(f, "worker panicked: {message}"),
        }
    }
}

/// Per-instance supervision settings
#[derive(Debug, Clone)]
pub struct ThreadSettings {
    /// Delay between the end of one invocation and the start of the next
    pub run_interval: Duration,
    /// Wall-clock limit for one invocation before it is flagged hung; zero disables
    pub hang_timeout: Duration,
    /// Isolate failures to this thread instead of aborting the process
    pub continue_on_error: bool,
    /// CPU share movement, in percentage points, that raises a change notification
    pub cpu_change_threshold: f64,
    /// Stack size for the OS thread; platform default when `None`
    pub stack_size: Option<usize>,
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self {
            run_interval: DEFAULT_RUN_INTERVAL,
            hang_timeout: Duration::ZERO,
            continue_on_error: true,
            cpu_change_threshold: DEFAULT_CPU_CHANGE_THRESHOLD,
            stack_size: None,
        }
    }
}

impl ThreadSettings {
    /// Settings with the given run interval and defaults elsewhere.
    #[must_use]
    pub fn every(run_interval: Duration) -> Self {
        Self {
            run_interval,
            ..Self::default()
        }
    }

    /// Sets the run interval.
    #[must_use]
    pub fn run_interval(mut self, interval: Duration) -> Self {
        self.run_interval = interval;
        self
    }

    /// Sets the hang timeout.
    #[must_use]
    pub fn hang_timeout(mut self, timeout: Duration) -> Self {
        self.hang_timeout = timeout;
        self
    }

    /// Sets failure isolation.
    #[must_use]
    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    /// Sets the CPU change threshold.
    #[must_use]
    pub fn cpu_change_threshold(mut self, percent: f64) -> Self {
        self.cpu_change_threshold = percent.max(0.0);
        self
    }

    /// Sets the stack size.
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

/// Point-in-time view of a [`ThreadManager`]
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSnapshot {
    /// Internal instance id
    pub id: u64,
    /// Registered name, once started
    pub name: Option<String>,
    /// Lifecycle state
    pub state: ThreadState,
    /// OS thread identifier, 0 until the thread runs
    pub os_thread_id: u64,
    /// Requested priority
    pub priority: ThreadPriority,
    /// Invocations started
    pub run_count: u64,
    /// Whether the current invocation is flagged hung
    pub hung: bool,
    /// Invocations flagged hung so far
    pub hang_detections: u64,
    /// Share of the process's CPU time, in percent
    pub process_cpu_usage: f64,
    /// Share of machine capacity, in percent
    pub system_cpu_usage: f64,
    /// Time since the thread started
    pub uptime: Option<Duration>,
}

/// Supervised unit of repeatable work on a dedicated thread
pub struct ThreadManager {
    id: u64,
    settings: ThreadSettings,
    worker: Mutex<Option<Box<dyn Worker>>>,
    abort_hook: Option<AbortHook>,
    token: CancellationToken,
    cancel_requested: AtomicBool,

    name: OnceLock<String>,
    priority: OnceLock<ThreadPriority>,
    state: AtomicU8,
    thread_id: OnceLock<ThreadId>,
    os_thread_id: AtomicU64,
    started_at: OnceLock<Instant>,

    invocation_started: Mutex<Option<Instant>>,
    hung: AtomicBool,
    hang_detections: AtomicU64,
    run_count: AtomicU64,
    last_failure: Mutex<Option<WorkerFailure>>,

    join_handle: Mutex<Option<JoinHandle<()>>>,
    exit_signal: Mutex<Option<Sender<()>>>,
    exited: Receiver<()>,

    thread_cpu_ns: AtomicU64,
    accounted_cpu_ns: AtomicU64,
    process_cpu_usage: AtomicU64,
    system_cpu_usage: AtomicU64,
    reported_cpu_usage: AtomicU64,
    cpu_usage_changed: AtomicBool,
}

impl ThreadManager {
    /// Creates an unstarted instance around `worker`.
    pub fn new<W: Worker>(worker: W, settings: ThreadSettings) -> Arc<Self> {
        let abort_hook = worker.abort_hook();
        let (exit_signal, exited) = channel::bounded(0);

        Arc::new(Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            settings,
            worker: Mutex::new(Some(Box::new(worker))),
            abort_hook,
            token: CancellationToken::new(),
            cancel_requested: AtomicBool::new(false),
            name: OnceLock::new(),
            priority: OnceLock::new(),
            state: AtomicU8::new(ThreadState::Created as u8),
            thread_id: OnceLock::new(),
            os_thread_id: AtomicU64::new(0),
            started_at: OnceLock::new(),
            invocation_started: Mutex::new(None),
            hung: AtomicBool::new(false),
            hang_detections: AtomicU64::new(0),
            run_count: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            join_handle: Mutex::new(None),
            exit_signal: Mutex::new(Some(exit_signal)),
            exited,
            thread_cpu_ns: AtomicU64::new(0),
            accounted_cpu_ns: AtomicU64::new(0),
            process_cpu_usage: AtomicU64::new(0f64.to_bits()),
            system_cpu_usage: AtomicU64::new(0f64.to_bits()),
            reported_cpu_usage: AtomicU64::new(0f64.to_bits()),
            cpu_usage_changed: AtomicBool::new(false),
        })
    }

    /// Internal instance id, unique for the process lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Registered name, set when the instance is started.
    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    /// Supervision settings.
    pub fn settings(&self) -> &ThreadSettings {
        &self.settings
    }

    /// Priority requested at start.
    pub fn priority(&self) -> ThreadPriority {
        self.priority.get().copied().unwrap_or_default()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the loop is active (running or winding down after cancel).
    pub fn is_running(&self) -> bool {
        matches!(self.state(), ThreadState::Running | ThreadState::Cancelling)
    }

    /// Whether cancellation has been requested.
    pub fn has_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The instance's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// OS thread identifier, 0 until the thread runs.
    pub fn os_thread_id(&self) -> u64 {
        self.os_thread_id.load(Ordering::Acquire)
    }

    /// Whether the current invocation is flagged hung.
    pub fn is_hung(&self) -> bool {
        self.hung.load(Ordering::Acquire)
    }

    /// Invocations flagged hung so far.
    pub fn hang_detections(&self) -> u64 {
        self.hang_detections.load(Ordering::Relaxed)
    }

    /// Invocations started so far.
    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::Relaxed)
    }

    /// Most recent invocation failure.
    pub fn last_failure(&self) -> Option<WorkerFailure> {
        self.last_failure.lock().clone()
    }

    /// When the thread entered its loop.
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at.get().copied()
    }

    /// Share of the process's CPU time from the last accounting sample, in percent.
    pub fn process_cpu_usage(&self) -> f64 {
        f64::from_bits(self.process_cpu_usage.load(Ordering::Relaxed))
    }

    /// Share of machine capacity from the last accounting sample, in percent.
    pub fn system_cpu_usage(&self) -> f64 {
        f64::from_bits(self.system_cpu_usage.load(Ordering::Relaxed))
    }

    /// Whether the last accounting sample crossed the change threshold.
    pub fn cpu_usage_changed(&self) -> bool {
        self.cpu_usage_changed.load(Ordering::Relaxed)
    }

    /// Thread CPU time last sampled by the thread itself, in nanoseconds.
    pub fn thread_cpu_time_ns(&self) -> u64 {
        self.thread_cpu_ns.load(Ordering::Relaxed)
    }

    /// Point-in-time view for hooks and diagnostics.
    pub fn snapshot(&self) -> ThreadSnapshot {
        ThreadSnapshot {
            id: self.id,
            name: self.name.get().cloned(),
            state: self.state(),
            os_thread_id: self.os_thread_id(),
            priority: self.priority(),
            run_count: self.run_count(),
            hung: self.is_hung(),
            hang_detections: self.hang_detections(),
            process_cpu_usage: self.process_cpu_usage(),
            system_cpu_usage: self.system_cpu_usage(),
            uptime: self.started_at().map(|at| at.elapsed()),
        }
    }

    /// Requests cancellation.
    ///
    /// Runs the worker's abort hook first, then marks the token cancelled so
    /// the loop exits at its next boundary. Later calls do nothing. Does not
    /// wait; see [`join`](Self::join).
    pub fn cancel(&self) {
        if self.cancel_requested.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(hook) = &self.abort_hook {
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                #[cfg(feature = "tracing")]
                warn!(id = self.id, name = ?self.name(), "Abort hook panicked");
            }
        }

        let running = self.transition(ThreadState::Running, ThreadState::Cancelling);
        if !running && self.transition(ThreadState::Created, ThreadState::Cancelled) {
            // Never started: nothing will run the loop
            self.worker.lock().take();
            self.signal_exit();
        }

        self.token.cancel();

        #[cfg(feature = "tracing")]
        debug!(id = self.id, name = ?self.name(), "Cancellation requested");
    }

    /// Waits up to `timeout` for the thread to exit and joins it.
    ///
    /// Returns `false` on timeout (the thread keeps running, detached once
    /// the instance is dropped) or when called from the supervised thread.
    pub fn join(&self, timeout: Duration) -> bool {
        if self.is_current_thread() {
            return false;
        }

        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.join_handle.lock().take() {
                    // Worker panics are caught inside the loop
                    let _ = handle.join();
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Whether the caller is the supervised thread.
    pub fn is_current_thread(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    /// Derives this thread's CPU share from one accounting interval.
    ///
    /// `process_delta` is the process CPU time and `system_delta` the machine
    /// capacity elapsed over the interval, `thread_delta` this thread's CPU
    /// time over the same interval, all in nanoseconds. Returns `true` when
    /// the process share moved by at least the change threshold since the
    /// last reported value.
    pub fn update_thread_usage(&self, process_delta: u64, system_delta: u64, thread_delta: u64) -> bool {
        let process_usage = percent_of(thread_delta, process_delta);
        let system_usage = percent_of(thread_delta, system_delta);

        self.process_cpu_usage.store(process_usage.to_bits(), Ordering::Relaxed);
        self.system_cpu_usage.store(system_usage.to_bits(), Ordering::Relaxed);

        let reported = f64::from_bits(self.reported_cpu_usage.load(Ordering::Relaxed));
        let changed = (process_usage - reported).abs() >= self.settings.cpu_change_threshold;
        if changed {
            self.reported_cpu_usage.store(process_usage.to_bits(), Ordering::Relaxed);
        }
        self.cpu_usage_changed.store(changed, Ordering::Relaxed);
        changed
    }

    /// CPU time sampled since the previous call, in nanoseconds.
    pub fn take_cpu_delta(&self) -> u64 {
        let now = self.thread_cpu_ns.load(Ordering::Relaxed);
        let previous = self.accounted_cpu_ns.swap(now, Ordering::Relaxed);
        now.saturating_sub(previous)
    }

    /* Run loop plumbing, driven by the registry */

    pub(crate) fn prepare_start(
        &self,
        name: &str,
        priority: ThreadPriority,
    ) -> Result<Box<dyn Worker>, SupervisorError> {
        if !self.transition(ThreadState::Created, ThreadState::Running) {
            return Err(SupervisorError::AlreadyStarted(self.id));
        }
        let worker = self
            .worker
            .lock()
            .take()
            .ok_or(SupervisorError::AlreadyStarted(self.id))?;

        let _ = self.name.set(name.to_string());
        let _ = self.priority.set(priority);
        Ok(worker)
    }

    pub(crate) fn attach_handle(&self, handle: JoinHandle<()>) {
        *self.join_handle.lock() = Some(handle);
    }

    pub(crate) fn spawn_failed(&self) {
        self.state.store(ThreadState::Failed as u8, Ordering::Release);
        self.signal_exit();
    }

    pub(crate) fn enter_thread(&self) {
        let _ = self.thread_id.set(thread::current().id());
        self.os_thread_id.store(os_thread::current_os_thread_id(), Ordering::Release);
        let _ = self.started_at.set(Instant::now());
    }

    pub(crate) fn begin_invocation(&self) {
        let mut started = self.invocation_started.lock();
        self.hung.store(false, Ordering::Release);
        *started = Some(Instant::now());
        self.run_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Clears the hung flag; returns the duration if this invocation
    /// overran and the watchdog had not already reported it.
    pub(crate) fn end_invocation(&self) -> Option<Duration> {
        let mut started = self.invocation_started.lock();
        let elapsed = started.take().map(|at| at.elapsed());

        let late = match elapsed {
            Some(elapsed) if self.overran(elapsed) && !self.hung.swap(true, Ordering::AcqRel) => {
                self.hang_detections.fetch_add(1, Ordering::Relaxed);
                Some(elapsed)
            }
            _ => None,
        };

        self.hung.store(false, Ordering::Release);
        late
    }

    /// Flags the current invocation hung once it overruns the timeout.
    /// Returns the elapsed time the first time it is flagged.
    pub(crate) fn check_hang(&self) -> Option<Duration> {
        let started = self.invocation_started.lock();
        let elapsed = (*started)?.elapsed();

        if self.overran(elapsed) && !self.hung.swap(true, Ordering::AcqRel) {
            self.hang_detections.fetch_add(1, Ordering::Relaxed);
            Some(elapsed)
        } else {
            None
        }
    }

    pub(crate) fn record_failure(&self, failure: WorkerFailure) {
        *self.last_failure.lock() = Some(failure);
    }

    pub(crate) fn record_thread_cpu(&self, nanos: u64) {
        self.thread_cpu_ns.fetch_max(nanos, Ordering::Relaxed);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub(crate) fn finish(&self, reason: ExitReason) {
        let state = match reason {
            ExitReason::Completed => ThreadState::Finished,
            ExitReason::Cancelled => ThreadState::Cancelled,
            ExitReason::Failed => ThreadState::Failed,
        };
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn signal_exit(&self) {
        self.exit_signal.lock().take();
    }

    fn overran(&self, elapsed: Duration) -> bool {
        !self.settings.hang_timeout.is_zero() && elapsed > self.settings.hang_timeout
    }

    fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for ThreadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadManager")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("state", &self.state())
            .field("hung", &self.is_hung())
            .finish()
    }
}
