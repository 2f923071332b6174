// Allocation tracking for the submission hot path
//
// Every test here is #[serial_test::serial]: dhat only allows one profiler
// at a time and the global allocator counts every thread in the binary.
//
// # Run all allocation tracking tests
// cargo test --test allocation_tracking -- --nocapture

use fabric_dma::DMA::Structs::{DmaRequest, Owner};
use fabric_dma::DMA::SimConfig;
use fabric_dma::{ChannelBuilder, DmaOpcode, Payload, PollStatus, SubmitMode};
use std::time::Duration;

#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

#[test]
#[serial_test::serial]
fn test_enqueue_is_allocation_free() {
    println!("\n--- Verifying zero-allocation enqueue ---");
    let channel = ChannelBuilder::new()
        .with_capacity(256)
        .with_sim_config(SimConfig::manual())
        .open(0, 0)
        .unwrap();
    let engine = channel.engine();
    let req = DmaRequest::write_inline(DmaOpcode::Write, 1, 0x100, &[9u8; 8]).unwrap();

    let _dhat = dhat::Profiler::new_heap();
    let before = dhat::HeapStats::get();

    for _ in 0..200 {
        engine
            .enqueue(&req, SubmitMode::FireAndForget, Owner::local())
            .unwrap();
    }

    let after = dhat::HeapStats::get();
    println!(
        "Heap blocks before: {}, after: {} (bytes {} -> {})",
        before.total_blocks, after.total_blocks, before.total_bytes, after.total_bytes
    );
    assert_eq!(after.total_blocks, before.total_blocks);
    assert_eq!(engine.queue_depth(), 200);
    println!("✓ 200 enqueues, zero heap allocations");
}

#[test]
#[serial_test::serial]
fn test_scan_and_restart_with_dhat() {
    println!("\n--- Running scan/restart cycles with dhat ---");
    let _dhat = dhat::Profiler::new_heap();

    let channel = ChannelBuilder::new()
        .with_capacity(64)
        .with_sim_config(SimConfig::manual())
        .open(0, 0)
        .unwrap();
    let sim = channel.simulator().unwrap().clone();

    for round in 0..50u64 {
        let tickets: Vec<_> = (0..20u64)
            .map(|i| {
                channel
                    .submit_write(1, i * 8, Payload::Bytes(&(round + i).to_le_bytes()), SubmitMode::Async)
                    .unwrap()
                    .unwrap()
            })
            .collect();
        sim.step(10);
        // Half done; restart in place and finish the rest
        channel.restart(false).unwrap();
        sim.step(64);
        for t in tickets {
            assert_eq!(channel.poll(t, Duration::from_millis(100)), PollStatus::Completed(None));
        }
        if round % 10 == 0 {
            println!("  Round {}: {:?}", round, channel.stats());
        }
    }

    let stats = dhat::HeapStats::get();
    println!("Live heap after 50 rounds: {} blocks, {} bytes", stats.curr_blocks, stats.curr_bytes);
    assert_eq!(channel.stats().restarts, 50);
    assert_eq!(channel.queue_depth(), 0);
    println!("✓ Check dhat output above for detailed allocation stats.");
}

#[test]
#[serial_test::serial]
fn test_restart_cycles_with_memory_stats() {
    println!("\n--- Running restart cycles with memory-stats ---");
    use memory_stats::memory_stats;

    let channel = ChannelBuilder::new().with_capacity(128).open(0, 0).unwrap();

    let before = memory_stats();
    println!("Memory before: {:?}", before);

    for round in 0..200u64 {
        for i in 0..32u64 {
            channel
                .submit_write(1, i * 8, Payload::Bytes(&round.to_le_bytes()), SubmitMode::FireAndForget)
                .unwrap();
        }
        channel.restart(round % 2 == 0).unwrap();
    }

    let after = memory_stats();
    println!("Memory after: {:?}", after);

    if let (Some(b), Some(a)) = (before, after) {
        let delta = a.physical_mem as i64 - b.physical_mem as i64;
        println!("Memory delta: {} bytes ({:.2} KB)", delta, delta as f64 / 1024.0);
        println!("  Note: restarts reuse the ring and completion queue in place.");
    }
    assert_eq!(channel.stats().restarts, 200);
}
