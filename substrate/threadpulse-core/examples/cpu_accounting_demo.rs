//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Demo of per-thread CPU accounting under the substrate

use std::sync::Arc;
use std::time::Duration;
use threadpulse_core::hooks::{ChannelHooks, SupervisorEvent};
use threadpulse_core::supervisor::{ThreadManager, ThreadSettings, worker_fn};
use threadpulse_core::{Substrate, SubstrateConfig, ThreadPriority};

fn main() {
    println!("CPU Accounting Demo\n");

    let config = SubstrateConfig::builder()
        .cpu_accounting(Duration::from_millis(250))
        .min_sampling_interval(Duration::from_millis(250))
        .build()
        .unwrap();
    let substrate = Substrate::initialise(config).unwrap();

    let (hooks, events) = ChannelHooks::unbounded();
    substrate.hooks().set_hooks(Arc::new(hooks));

    if let Some(collector) = substrate.collector() {
        println!("Using timer: {}", collector.timer().platform_name());
        println!("Logical CPUs: {}\n", collector.logical_cpus());
    }

    // One thread spins, one mostly sleeps
    let busy = ThreadManager::new(
        worker_fn(|_| {
            let mut sum = 0u64;
            for i in 0..2_000_000 {
                sum = sum.wrapping_add(i);
            }
            std::hint::black_box(sum);
            Ok(true)
        }),
        ThreadSettings::every(Duration::from_millis(1)).cpu_change_threshold(2.0),
    );
    let idle = ThreadManager::new(
        worker_fn(|_| Ok(true)),
        ThreadSettings::every(Duration::from_millis(100)).cpu_change_threshold(2.0),
    );

    let registry = substrate.registry();
    registry.thread_start(&busy, "busy", ThreadPriority::Normal, false).unwrap();
    registry.thread_start(&idle, "idle", ThreadPriority::Normal, false).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while let Ok(event) = events.recv_deadline(deadline) {
        if let SupervisorEvent::CpuChanged {
            thread,
            process_usage,
            system_usage,
        } = event
        {
            println!(
                "{:<6} process share {:>6.2}%  machine share {:>6.2}%",
                thread.name.as_deref().unwrap_or("?"),
                process_usage,
                system_usage
            );
        }
    }

    println!("\nFinal readings:");
    for snapshot in registry.snapshots().unwrap() {
        println!(
            "  {:<28} runs {:>5}  process {:>6.2}%  machine {:>6.2}%",
            snapshot.name.as_deref().unwrap_or("?"),
            snapshot.run_count,
            snapshot.process_cpu_usage,
            snapshot.system_cpu_usage
        );
    }

    substrate.finalise().unwrap();
}
