// Caller-facing channel API over the simulated engine.
// Run with: cargo test --test channel -- --nocapture

use fabric_dma::DMA::SimConfig;
use fabric_dma::{
    ChannelBuilder, DmaError, DmaOpcode, Payload, PollStatus, PollStrategy, SubmitMode,
};
use std::time::Duration;

const DEST: u16 = 7;
const WAIT: Duration = Duration::from_secs(1);

#[test]
fn test_inline_read_after_write() {
    let channel = ChannelBuilder::new().open(0, 0).unwrap();

    let ticket = channel
        .submit_write(DEST, 0x40, Payload::Bytes(b"hello fabric"), SubmitMode::Async)
        .unwrap()
        .unwrap();
    assert_eq!(channel.poll(ticket, WAIT), PollStatus::Completed(None));

    let data = channel.read(DEST, 0x40, 12, WAIT).unwrap();
    assert_eq!(data, b"hello fabric");

    // Other destinations have their own memory
    assert_eq!(channel.read(DEST + 1, 0x40, 4, WAIT).unwrap(), vec![0u8; 4]);
    println!("✓ Inline round trip: {:?}", channel.stats());
}

#[test]
fn test_sync_submission_resolves_before_returning() {
    let channel = ChannelBuilder::new().open(0, 0).unwrap();

    let ticket = channel
        .submit_write(DEST, 0, Payload::Bytes(&[1, 2, 3, 4]), SubmitMode::Sync)
        .unwrap()
        .unwrap();
    // Already resolved, so a zero-wait poll would not block
    assert_eq!(channel.poll(ticket, Duration::ZERO), PollStatus::Completed(None));
    assert_eq!(channel.queue_depth(), 0);
}

#[test]
fn test_bulk_transfers() {
    let channel = ChannelBuilder::new().open(0, 0).unwrap();
    let region = channel.alloc_buffer(4096).unwrap();
    println!("Allocated {:?}", region);

    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    region.write(0, &payload).unwrap();

    let out = region.pin(0, payload.len()).unwrap();
    let ticket = channel
        .submit_write(DEST, 0x1000, Payload::Buffer(out), SubmitMode::Async)
        .unwrap()
        .unwrap();
    assert_eq!(channel.poll(ticket, WAIT), PollStatus::Completed(None));

    let sim = channel.simulator().unwrap();
    assert_eq!(sim.remote_read(DEST, 0x1000, payload.len()).unwrap(), payload);

    let back = region.pin(2048, payload.len()).unwrap();
    let ticket = channel
        .submit_read(DEST, 0x1000, Payload::Buffer(back), SubmitMode::Async)
        .unwrap()
        .unwrap();
    // Bulk reads land in the buffer, not in the poll result
    assert_eq!(channel.poll(ticket, WAIT), PollStatus::Completed(None));

    let mut landed = vec![0u8; payload.len()];
    region.read(2048, &mut landed).unwrap();
    assert_eq!(landed, payload);
    println!("✓ {} bytes out and back through a pinned buffer", payload.len());
}

#[test]
fn test_posted_write_opcodes() {
    let channel = ChannelBuilder::new().open(0, 0).unwrap();

    for opcode in [DmaOpcode::Write, DmaOpcode::AllWrites, DmaOpcode::WriteWithResponse] {
        let ticket = channel
            .submit(opcode, DEST, 0x80, Payload::Bytes(&[opcode as u8; 4]), SubmitMode::Async)
            .unwrap()
            .unwrap();
        assert_eq!(channel.poll(ticket, WAIT), PollStatus::Completed(None));
        assert_eq!(channel.read(DEST, 0x80, 4, WAIT).unwrap(), vec![opcode as u8; 4]);
    }

    let err = channel
        .submit(DmaOpcode::Write, DEST, 0, Payload::Len(4), SubmitMode::Async)
        .unwrap_err();
    assert!(matches!(err, DmaError::InvalidRequest(_)));
}

#[test]
fn test_poll_times_out_while_in_flight() {
    let channel = ChannelBuilder::new()
        .with_sim_config(SimConfig::manual())
        .open(0, 0)
        .unwrap();

    let ticket = channel
        .submit_read(DEST, 0, Payload::Len(8), SubmitMode::Async)
        .unwrap()
        .unwrap();
    assert_eq!(channel.poll(ticket, Duration::from_millis(5)), PollStatus::InProgress);

    channel.simulator().unwrap().step(1);
    assert_eq!(channel.poll(ticket, WAIT), PollStatus::Completed(Some(vec![0u8; 8])));
}

#[test]
#[should_panic(expected = "already collected")]
fn test_poll_after_collect_panics() {
    let channel = ChannelBuilder::new().open(0, 0).unwrap();
    let ticket = channel
        .submit_write(DEST, 0, Payload::Bytes(b"x"), SubmitMode::Sync)
        .unwrap()
        .unwrap();
    assert_eq!(channel.poll(ticket, WAIT), PollStatus::Completed(None));
    channel.poll(ticket, WAIT);
}

#[test]
#[should_panic(expected = "unknown")]
fn test_poll_foreign_ticket_panics() {
    let a = ChannelBuilder::new().open(0, 0).unwrap();
    let b = ChannelBuilder::new().open(0, 1).unwrap();
    let ticket = a
        .submit_write(DEST, 0, Payload::Bytes(b"x"), SubmitMode::Async)
        .unwrap()
        .unwrap();
    // Same number, but b never issued it
    b.poll(ticket, WAIT);
}

#[test]
fn test_scanner_thread() {
    let channel = ChannelBuilder::new()
        .with_scanner_thread(true)
        .with_scanner_cpu(0)
        .with_poll_strategy(PollStrategy::BusyWait)
        .open(0, 0)
        .unwrap();

    let tickets: Vec<_> = (0..100u64)
        .map(|i| loop {
            match channel.submit_write(DEST, i * 8, Payload::Bytes(&i.to_le_bytes()), SubmitMode::Async) {
                Ok(t) => break t.unwrap(),
                Err(DmaError::QueueFull) => std::thread::yield_now(),
                Err(e) => panic!("submit failed: {e}"),
            }
        })
        .collect();

    for ticket in tickets {
        assert_eq!(channel.poll(ticket, WAIT), PollStatus::Completed(None));
    }
    for i in (0..100u64).step_by(10) {
        assert_eq!(channel.read(DEST, i * 8, 8, WAIT).unwrap(), i.to_le_bytes());
    }
    println!("✓ Background scanner: {:?}", channel.stats());
    channel.close();
}

#[test]
fn test_restart_is_master_only_and_idempotent_close() {
    let channel = ChannelBuilder::new().open(0, 0).unwrap();
    channel.restart(false).unwrap();
    channel.restart(true).unwrap();
    assert_eq!(channel.stats().restarts, 2);

    channel.close();
    channel.close();
    assert!(channel.engine().is_closed());
}

#[test]
fn test_external_registers_and_tuning() {
    use fabric_dma::Core::PrivateDmaAllocator;
    use fabric_dma::DMA::SimEngine;
    use std::sync::Arc;

    // Hardware handed in from outside: nothing steps it but this test
    let hw = Arc::new(SimEngine::new(SimConfig::manual()));
    let channel = ChannelBuilder::new()
        .with_capacity(32)
        .with_completion_rows(2)
        .with_scan_budget(4)
        .with_drain_grace(Duration::from_micros(100))
        .with_sync_timeout(Duration::from_millis(20))
        .with_registers(hw.clone())
        .with_allocator(Arc::new(PrivateDmaAllocator))
        .open(0, 0)
        .unwrap();
    assert!(channel.simulator().is_none());

    let tickets: Vec<_> = (0..6u64)
        .map(|i| {
            channel
                .submit_write(DEST, i * 8, Payload::Bytes(&[i as u8; 8]), SubmitMode::Async)
                .unwrap()
                .unwrap()
        })
        .collect();

    // Sync gives up after the configured timeout; the ticket stays live
    let sync = channel
        .submit_write(DEST, 0x100, Payload::Bytes(b"late"), SubmitMode::Sync)
        .unwrap()
        .unwrap();
    assert_eq!(channel.poll(sync, Duration::from_millis(5)), PollStatus::InProgress);

    assert_eq!(hw.step(64), 7);
    for t in tickets {
        assert_eq!(channel.poll(t, WAIT), PollStatus::Completed(None));
    }
    assert_eq!(channel.poll(sync, WAIT), PollStatus::Completed(None));
    assert_eq!(hw.remote_read(DEST, 0x100, 4).unwrap(), b"late");
    assert_eq!(channel.stats().completed, 7);
    println!("✓ External registers, 7 completions over a 16-entry FIFO");
}
