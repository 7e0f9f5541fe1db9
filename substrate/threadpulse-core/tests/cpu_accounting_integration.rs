//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Integration tests for CPU accounting of supervised threads
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use threadpulse_core::accounting::CpuUsageCollector;
use threadpulse_core::substrate::COLLECTOR_THREAD_NAME;
use threadpulse_core::supervisor::{worker_fn, ThreadManager, ThreadSettings};
use threadpulse_core::timing::create_cpu_timer;
use threadpulse_core::{Substrate, SubstrateConfig, ThreadPriority};

fn spin(iterations: u64) -> u64 {
    let mut sum = 0u64;
    for i in 0..iterations {
        sum = std::hint::black_box(sum.wrapping_add(i));
    }
    sum
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn accounting_substrate() -> Arc<Substrate> {
    let config = SubstrateConfig::builder()
        .cpu_accounting(Duration::from_millis(20))
        .min_sampling_interval(Duration::from_millis(20))
        .watchdog_interval(Duration::ZERO)
        .sweep_interval(Duration::ZERO)
        .build()
        .unwrap();
    Substrate::initialise(config).unwrap()
}

#[test]
fn test_timer_reports_platform() {
    let timer = create_cpu_timer();
    assert!(!timer.platform_name().is_empty());

    let before = timer.thread_cpu_time_ns().unwrap();
    spin(2_000_000);
    let after = timer.thread_cpu_time_ns().unwrap();
    assert!(after >= before);
}

#[test]
fn test_busy_thread_gets_cpu_share() {
    let substrate = accounting_substrate();
    let collector = substrate.collector().unwrap();

    let busy = ThreadManager::new(
        worker_fn(|_| {
            spin(500_000);
            Ok(true)
        }),
        ThreadSettings::every(Duration::from_millis(1)),
    );
    substrate
        .registry()
        .thread_start(&busy, "busy", ThreadPriority::Normal, false)
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || collector.is_watching(busy.id())));
    assert!(wait_until(Duration::from_secs(5), || busy.process_cpu_usage() > 0.0));
    assert!(busy.process_cpu_usage() <= 100.0);
    assert!(busy.thread_cpu_time_ns() > 0);

    substrate.registry().cancel("busy").unwrap();
    assert!(wait_until(Duration::from_secs(5), || !collector.is_watching(busy.id())));

    substrate.finalise().unwrap();
}

#[test]
fn test_collector_watches_itself() {
    let substrate = accounting_substrate();
    let collector = substrate.collector().unwrap();

    let own = substrate.registry().get(COLLECTOR_THREAD_NAME).unwrap().unwrap();
    assert!(wait_until(Duration::from_secs(5), || collector.is_watching(own.id())));

    substrate.finalise().unwrap();
    assert_eq!(collector.watched_count(), 0);
}

#[test]
fn test_process_usage_is_cached_within_interval() {
    let substrate = accounting_substrate();
    let collector = substrate.collector().unwrap();

    // Let the minimum interval pass, then compute once
    thread::sleep(Duration::from_millis(30));
    let first = collector.get_process_usage();
    assert!((0.0..=100.0).contains(&first));

    // A burst of reads inside the interval sees the same value
    for _ in 0..5 {
        assert_eq!(collector.get_process_usage().to_bits(), first.to_bits());
    }

    substrate.finalise().unwrap();
}
