//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Integration tests for supervised threads and the registry
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use threadpulse_core::config::RegistryConfig;
use threadpulse_core::hooks::{ChannelHooks, HookRegistry, SupervisorEvent, SupervisorHooks};
use threadpulse_core::metrics::SubstrateMetrics;
use threadpulse_core::supervisor::{
    worker_fn, ExitReason, SupervisorError, ThreadManager, ThreadRegistry, ThreadSettings, ThreadSnapshot,
    ThreadState, WorkerFailure,
};
use threadpulse_core::ThreadPriority;

const EVENT_WAIT: Duration = Duration::from_secs(5);

fn registry_with_events(config: RegistryConfig) -> (ThreadRegistry, crossbeam::channel::Receiver<SupervisorEvent>) {
    let hooks = Arc::new(HookRegistry::new());
    let (channel, events) = ChannelHooks::unbounded();
    hooks.set_hooks(Arc::new(channel));
    (ThreadRegistry::new(config, hooks, Arc::new(SubstrateMetrics::new())), events)
}

fn looping(interval: Duration) -> Arc<ThreadManager> {
    ThreadManager::new(worker_fn(|_| Ok(true)), ThreadSettings::every(interval))
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn test_exists_across_lifecycle() {
    let registry = ThreadRegistry::default();
    let manager = looping(Duration::from_millis(5));

    assert!(!registry.exists("lifecycle").unwrap());
    registry
        .thread_start(&manager, "lifecycle", ThreadPriority::Normal, false)
        .unwrap();
    assert!(registry.exists("lifecycle").unwrap());

    assert_eq!(registry.cancel("lifecycle").unwrap(), 1);
    assert!(!registry.exists("lifecycle").unwrap());
    assert_eq!(manager.state(), ThreadState::Cancelled);
}

#[test]
fn test_duplicate_name_leaves_one_registered() {
    let registry = ThreadRegistry::default();
    let first = looping(Duration::from_millis(5));
    let second = looping(Duration::from_millis(5));

    registry.thread_start(&first, "dup", ThreadPriority::Normal, false).unwrap();
    let err = registry
        .thread_start(&second, "dup", ThreadPriority::Normal, false)
        .unwrap_err();
    assert!(matches!(err, SupervisorError::DuplicateName(ref name) if name == "dup"));

    assert_eq!(registry.count().unwrap(), 1);
    assert_eq!(second.state(), ThreadState::Created);
    registry.cancel_all().unwrap();
}

#[test]
fn test_allow_multiple_instances() {
    let registry = ThreadRegistry::default();
    let instances: Vec<_> = (0..3).map(|_| looping(Duration::from_millis(5))).collect();
    for manager in &instances {
        registry.thread_start(manager, "pool", ThreadPriority::Normal, true).unwrap();
    }

    assert_eq!(registry.names().unwrap(), vec!["pool"; 3]);
    assert_eq!(registry.cancel("pool").unwrap(), 3);
    assert!(instances.iter().all(|m| m.state() == ThreadState::Cancelled));
}

#[test]
fn test_running_thread_limit() {
    let config = RegistryConfig {
        max_running_threads: 2,
        ..RegistryConfig::default()
    };
    let registry = ThreadRegistry::new(config, Arc::new(HookRegistry::new()), Arc::new(SubstrateMetrics::new()));

    registry.thread_start(&looping(Duration::from_millis(5)), "a", ThreadPriority::Normal, false).unwrap();
    registry.thread_start(&looping(Duration::from_millis(5)), "b", ThreadPriority::Normal, false).unwrap();

    let rejected = looping(Duration::from_millis(5));
    let err = registry
        .thread_start(&rejected, "c", ThreadPriority::Normal, false)
        .unwrap_err();
    assert!(matches!(err, SupervisorError::ThreadLimitReached { limit: 2 }));
    assert!(!registry.exists("c").unwrap());
    assert_eq!(rejected.state(), ThreadState::Created);

    registry.finalise().unwrap();
}

#[test]
fn test_failure_is_isolated() {
    let (registry, events) = registry_with_events(RegistryConfig::default());

    let healthy_runs = Arc::new(AtomicU64::new(0));
    let healthy = {
        let runs = Arc::clone(&healthy_runs);
        ThreadManager::new(
            worker_fn(move |_| {
                runs.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }),
            ThreadSettings::every(Duration::from_millis(2)),
        )
    };
    let failing = ThreadManager::new(
        worker_fn(|_| Err("disk on fire".into())),
        ThreadSettings::every(Duration::from_millis(2)).continue_on_error(true),
    );

    registry.thread_start(&healthy, "healthy", ThreadPriority::Normal, false).unwrap();
    registry.thread_start(&failing, "failing", ThreadPriority::Normal, false).unwrap();

    assert!(failing.join(EVENT_WAIT));
    assert_eq!(failing.state(), ThreadState::Failed);
    assert_eq!(
        failing.last_failure(),
        Some(WorkerFailure::Error("disk on fire".to_string()))
    );
    assert!(!registry.exists("failing").unwrap());

    // The other thread keeps going
    let before = healthy_runs.load(Ordering::Relaxed);
    assert!(wait_until(EVENT_WAIT, || healthy_runs.load(Ordering::Relaxed) > before + 2));
    assert!(registry.exists("healthy").unwrap());

    let mut saw_exception = false;
    let mut saw_failed_exit = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SupervisorEvent::Exception(thread, failure) if thread.name.as_deref() == Some("failing") => {
                assert!(matches!(failure, WorkerFailure::Error(_)));
                saw_exception = true;
            }
            SupervisorEvent::Exited(thread, reason) if thread.name.as_deref() == Some("failing") => {
                assert!(saw_exception, "exception must be reported before exit");
                assert_eq!(reason, ExitReason::Failed);
                saw_failed_exit = true;
            }
            _ => {}
        }
    }
    assert!(saw_exception && saw_failed_exit);

    registry.finalise().unwrap();
}

#[test]
fn test_panicking_worker_is_caught() {
    let registry = ThreadRegistry::default();
    let manager = ThreadManager::new(
        worker_fn(|_| panic!("worker exploded")),
        ThreadSettings::every(Duration::from_millis(2)),
    );

    registry.thread_start(&manager, "panicky", ThreadPriority::Normal, false).unwrap();
    assert!(manager.join(EVENT_WAIT));
    assert_eq!(manager.state(), ThreadState::Failed);
    assert_eq!(
        manager.last_failure(),
        Some(WorkerFailure::Panicked("worker exploded".to_string()))
    );
    assert_eq!(registry.metrics().snapshot().worker_failures, 1);
}

/// Observer that panics on start, failure and exit
struct ExplodingHooks;

impl SupervisorHooks for ExplodingHooks {
    fn on_thread_started(&self, _thread: &ThreadSnapshot) {
        panic!("observer failed on start");
    }

    fn on_thread_exited(&self, _thread: &ThreadSnapshot, _reason: ExitReason) {
        panic!("observer failed on exit");
    }

    fn on_exception(&self, _thread: &ThreadSnapshot, _failure: &WorkerFailure) {
        panic!("observer failed on exception");
    }

    fn on_hung(&self, _thread: &ThreadSnapshot, _elapsed: Duration) {}

    fn on_cpu_changed(&self, _thread: &ThreadSnapshot, _process: f64, _system: f64) {}
}

#[test]
fn test_panicking_hooks_do_not_block_deregistration() {
    let hooks = Arc::new(HookRegistry::new());
    hooks.set_hooks(Arc::new(ExplodingHooks));
    let registry = ThreadRegistry::new(RegistryConfig::default(), hooks, Arc::new(SubstrateMetrics::new()));

    let failing = ThreadManager::new(
        worker_fn(|_| Err("boom".into())),
        ThreadSettings::every(Duration::from_millis(2)).continue_on_error(true),
    );
    registry.thread_start(&failing, "failing", ThreadPriority::Normal, false).unwrap();

    assert!(failing.join(EVENT_WAIT));
    assert_eq!(failing.state(), ThreadState::Failed);
    assert!(!registry.exists("failing").unwrap());

    // The name is free again
    let replacement = looping(Duration::from_millis(5));
    registry
        .thread_start(&replacement, "failing", ThreadPriority::Normal, false)
        .unwrap();
    assert!(registry.exists("failing").unwrap());

    assert_eq!(registry.cancel("failing").unwrap(), 1);
    assert!(replacement.join(EVENT_WAIT));
    assert_eq!(replacement.state(), ThreadState::Cancelled);
    assert!(!registry.exists("failing").unwrap());
}

#[test]
fn test_abort_hook_runs_before_cancellation_is_observed() {
    let registry = ThreadRegistry::default();
    let order = Arc::new(Mutex::new(Vec::new()));

    let worker = {
        let order = Arc::clone(&order);
        let hook_order = Arc::clone(&order);
        worker_fn(move |ctx| {
            // Parks until cancelled, like a blocking receive
            if ctx.wait(Duration::from_secs(30)) {
                order.lock().push("observed");
                return Ok(false);
            }
            Ok(true)
        })
        .with_abort_hook(move || hook_order.lock().push("abort"))
    };
    let manager = ThreadManager::new(worker, ThreadSettings::every(Duration::from_millis(1)));

    registry.thread_start(&manager, "receiver", ThreadPriority::Normal, false).unwrap();
    assert!(wait_until(EVENT_WAIT, || manager.run_count() > 0));

    let started = Instant::now();
    registry.cancel("receiver").unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(order.lock().as_slice(), &["abort", "observed"]);
    assert_eq!(manager.state(), ThreadState::Cancelled);
}

#[test]
fn test_cancel_wakes_interval_sleep() {
    let registry = ThreadRegistry::default();
    let manager = looping(Duration::from_secs(60));

    registry.thread_start(&manager, "sleepy", ThreadPriority::Normal, false).unwrap();
    assert!(wait_until(EVENT_WAIT, || manager.run_count() == 1));

    let started = Instant::now();
    assert_eq!(registry.cancel("sleepy").unwrap(), 1);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(manager.has_cancelled());
}

#[test]
fn test_hang_detection_flags_without_stopping() {
    let (registry, events) = registry_with_events(RegistryConfig::default());
    let manager = ThreadManager::new(
        worker_fn(|_| {
            thread::sleep(Duration::from_millis(200));
            Ok(false)
        }),
        ThreadSettings::every(Duration::from_millis(1)).hang_timeout(Duration::from_millis(30)),
    );

    registry.thread_start(&manager, "slow", ThreadPriority::Normal, false).unwrap();
    assert!(wait_until(EVENT_WAIT, || manager.run_count() == 1));
    thread::sleep(Duration::from_millis(60));

    assert_eq!(registry.check_hung().unwrap(), 1);
    assert!(manager.is_hung());
    // Reported once per invocation
    assert_eq!(registry.check_hung().unwrap(), 0);

    // The invocation still completes normally
    assert!(manager.join(EVENT_WAIT));
    assert_eq!(manager.state(), ThreadState::Finished);
    assert!(!manager.is_hung());
    assert_eq!(manager.hang_detections(), 1);

    let hung_events = events
        .try_iter()
        .filter(|event| matches!(event, SupervisorEvent::Hung(..)))
        .count();
    assert_eq!(hung_events, 1);
}

#[test]
fn test_manager_cannot_start_twice() {
    let registry = ThreadRegistry::default();
    let manager = looping(Duration::from_millis(5));

    registry.thread_start(&manager, "once", ThreadPriority::Normal, false).unwrap();
    registry.cancel("once").unwrap();

    let err = registry
        .thread_start(&manager, "once-again", ThreadPriority::Normal, false)
        .unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyStarted(id) if id == manager.id()));
}

#[test]
fn test_lifecycle_events() {
    let (registry, events) = registry_with_events(RegistryConfig::default());
    let manager = looping(Duration::from_millis(5));

    registry.thread_start(&manager, "observed", ThreadPriority::Normal, false).unwrap();
    match events.recv_timeout(EVENT_WAIT).unwrap() {
        SupervisorEvent::Started(thread) => {
            assert_eq!(thread.name.as_deref(), Some("observed"));
            assert_eq!(thread.state, ThreadState::Running);
        }
        other => panic!("expected start event, got {other:?}"),
    }

    registry.cancel("observed").unwrap();
    let exit = events
        .iter()
        .find_map(|event| match event {
            SupervisorEvent::Exited(_, reason) => Some(reason),
            _ => None,
        })
        .unwrap();
    assert_eq!(exit, ExitReason::Cancelled);
}

#[test]
fn test_self_cancellation_from_worker() {
    let registry = ThreadRegistry::default();
    let handle = registry.clone();
    let manager = ThreadManager::new(
        worker_fn(move |ctx| {
            // Joining ourselves would deadlock; the registry skips it
            handle.cancel(ctx.name()).map(|_| true).map_err(Into::into)
        }),
        ThreadSettings::every(Duration::from_millis(1)),
    );

    registry.thread_start(&manager, "quitter", ThreadPriority::Normal, false).unwrap();
    assert!(manager.join(EVENT_WAIT));
    assert_eq!(manager.state(), ThreadState::Cancelled);
    assert!(!registry.exists("quitter").unwrap());
}
