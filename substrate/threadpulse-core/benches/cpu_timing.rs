//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Benchmarks for CPU timers and the accounting sample path

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;
use threadpulse_core::accounting::{CpuUsageCollector, ProcessCpuCollector};
use threadpulse_core::hooks::HookRegistry;
use threadpulse_core::metrics::SubstrateMetrics;
use threadpulse_core::supervisor::{ThreadManager, ThreadSettings, worker_fn};
use threadpulse_core::timing::create_cpu_timer;

fn bench_thread_cpu_time(c: &mut Criterion) {
    let timer = create_cpu_timer();
    let platform = timer.platform_name();

    c.bench_function(&format!("cpu_timer/{platform}/thread"), |b| {
        b.iter(|| black_box(timer.thread_cpu_time_ns().unwrap()));
    });
}

fn bench_process_cpu_time(c: &mut Criterion) {
    let timer = create_cpu_timer();
    let platform = timer.platform_name();

    // Process clocks are the expensive read on most platforms
    c.bench_function(&format!("cpu_timer/{platform}/process"), |b| {
        b.iter(|| black_box(timer.process_cpu_time_ns().unwrap()));
    });
}

fn bench_timer_vs_instant(c: &mut Criterion) {
    use std::time::Instant;

    let timer = create_cpu_timer();
    let mut group = c.benchmark_group("timing_comparison");

    group.bench_function("thread_cpu_time", |b| {
        b.iter(|| black_box(timer.thread_cpu_time_ns().unwrap()));
    });

    group.bench_function("instant_now", |b| {
        b.iter(|| black_box(Instant::now()));
    });

    group.finish();
}

fn bench_collector_sample(c: &mut Criterion) {
    let mut group = c.benchmark_group("collector_sample");

    for watched in [1usize, 16, 128] {
        let collector = ProcessCpuCollector::new(Arc::new(HookRegistry::new()), Arc::new(SubstrateMetrics::new()));
        let managers: Vec<_> = (0..watched)
            .map(|_| ThreadManager::new(worker_fn(|_| Ok(true)), ThreadSettings::every(Duration::from_secs(1))))
            .collect();
        for manager in &managers {
            collector.thread_add(manager);
        }

        group.bench_with_input(BenchmarkId::from_parameter(watched), &collector, |b, collector| {
            b.iter(|| black_box(collector.sample().unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_thread_cpu_time,
    bench_process_cpu_time,
    bench_timer_vs_instant,
    bench_collector_sample,
);

criterion_main!(benches);
