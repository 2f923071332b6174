// Randomised workloads: concurrent submitters against a background
// scanner, and seeded fault injection against a manually stepped engine.
// Run with: cargo test --test stress -- --nocapture

use fabric_dma::DMA::{SimConfig, SIM_INJECT_IMPL_ERR, SIM_INJECT_PCIE_ERR, SIM_INJECT_TIMEOUT};
use fabric_dma::{ChannelBuilder, DmaError, Payload, PollStatus, SubmitMode, Ticket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_concurrent_submitters() {
    let _ = env_logger::builder().is_test(true).try_init();

    let channel = Arc::new(
        ChannelBuilder::new()
            .with_capacity(64)
            .with_scanner_thread(true)
            .open(0, 0)
            .unwrap(),
    );
    let threads = 4u64;
    let per_thread = 500u64;

    let mut handles = Vec::new();
    for id in 0..threads {
        let channel = channel.clone();
        handles.push(thread::spawn(move || {
            let mut rng = fastrand::Rng::with_seed(id + 1);
            let base = id * 0x10000;
            for i in 0..per_thread {
                let raddr = base + rng.u64(0..512) * 8;
                let value = (id << 32 | i).to_le_bytes();
                let mode = if rng.bool() { SubmitMode::Async } else { SubmitMode::Sync };

                let ticket = loop {
                    match channel.submit_write(1, raddr, Payload::Bytes(&value), mode) {
                        Ok(t) => break t.unwrap(),
                        Err(DmaError::QueueFull) => thread::yield_now(),
                        Err(e) => panic!("thread {id}: submit failed: {e}"),
                    }
                };
                assert_eq!(channel.poll(ticket, Duration::from_secs(5)), PollStatus::Completed(None));

                // Nobody else writes this range
                let back = channel.read(1, raddr, 8, Duration::from_secs(5)).unwrap();
                assert_eq!(back, value);

                if i % 100 == 0 {
                    println!("  Thread {}: {} round trips", id, i);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let stats = channel.stats();
    println!("✓ {} threads done: {:?}", threads, stats);
    assert_eq!(stats.completed, threads * per_thread * 2);
    assert_eq!(stats.faulted, 0);
    assert_eq!(stats.queue_depth, 0);
}

#[test]
fn test_random_faults_resolve_every_ticket() {
    let _ = env_logger::builder().is_test(true).try_init();

    let channel = ChannelBuilder::new()
        .with_capacity(32)
        .with_sim_config(SimConfig::manual())
        .open(0, 0)
        .unwrap();
    let sim = channel.simulator().unwrap().clone();
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    let faults = [SIM_INJECT_TIMEOUT, SIM_INJECT_IMPL_ERR, SIM_INJECT_PCIE_ERR];

    let mut total = 0u64;
    let mut faulted = 0u64;
    for round in 0..100 {
        let n = rng.u32(1..=20);
        let (_, wp) = channel.engine().write_state();
        let mut open: Vec<Ticket> = (0..n)
            .map(|i| {
                let raddr = u64::from(i) * 8;
                if rng.bool() {
                    channel.submit_read(1, raddr, Payload::Len(8), SubmitMode::Async)
                } else {
                    channel.submit_write(1, raddr, Payload::Bytes(&[round as u8; 8]), SubmitMode::Async)
                }
                .unwrap()
                .unwrap()
            })
            .collect();
        total += u64::from(n);

        if rng.u8(0..3) == 0 {
            let at = wp.wrapping_add(rng.u32(0..n));
            sim.arm_fault(faults[rng.usize(0..faults.len())], Some(at));
        }

        for _ in 0..1000 {
            if open.is_empty() {
                break;
            }
            sim.step(rng.u32(1..=8));
            channel.service();
            open.retain(|t| match channel.poll(*t, Duration::from_millis(1)) {
                PollStatus::InProgress => true,
                PollStatus::Completed(_) => false,
                PollStatus::Faulted(_) => {
                    faulted += 1;
                    false
                }
            });
        }
        assert!(open.is_empty(), "round {round}: {} tickets never resolved", open.len());
        assert_eq!(channel.queue_depth(), 0, "round {round}");
    }

    let stats = channel.stats();
    println!("✓ {} operations, {} faulted: {:?}", total, faulted, stats);
    assert_eq!(stats.faulted, faulted);
    assert_eq!(stats.completed + stats.faulted, total);
    assert!(stats.restarts >= faulted);
}
