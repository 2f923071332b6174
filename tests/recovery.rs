// Abort detection and restart. Faults are injected through the simulator
// so each scenario stops at a known descriptor.
// Run with: cargo test --test recovery -- --nocapture

use fabric_dma::DMA::{SimConfig, SimEngine, SIM_INJECT_RIO_ERR, SIM_INJECT_TIMEOUT};
use fabric_dma::{
    AbortReason, Channel, ChannelBuilder, DmaError, Payload, PollStatus, SubmitMode, Ticket,
};
use std::sync::Arc;
use std::time::Duration;

const DEST: u16 = 3;
const WAIT: Duration = Duration::from_millis(100);

fn manual_channel(capacity: u32) -> (Channel, Arc<SimEngine>) {
    let channel = ChannelBuilder::new()
        .with_capacity(capacity)
        .with_sim_config(SimConfig::manual())
        .open(0, 1)
        .unwrap();
    let sim = channel.simulator().unwrap().clone();
    (channel, sim)
}

fn pattern(i: u64) -> [u8; 8] {
    (0xA5A5_0000_0000_0000 | i).to_le_bytes()
}

/// Preload remote memory and queue one inline read per word.
fn queue_reads(channel: &Channel, sim: &SimEngine, count: u64) -> Vec<Ticket> {
    (0..count)
        .map(|i| {
            assert!(sim.remote_write(DEST, i * 8, &pattern(i)));
            channel
                .submit_read(DEST, i * 8, Payload::Len(8), SubmitMode::Async)
                .unwrap()
                .unwrap()
        })
        .collect()
}

fn queue_writes(channel: &Channel, first: u64, count: u64) -> Vec<Ticket> {
    (first..first + count)
        .map(|i| {
            channel
                .submit_write(DEST, i * 8, Payload::Bytes(&pattern(i)), SubmitMode::Async)
                .unwrap()
                .unwrap()
        })
        .collect()
}

#[test]
fn test_fault_mid_queue_salvages_the_rest() {
    let (channel, sim) = manual_channel(32);
    let (_, first_wp) = channel.engine().write_state();
    let tickets = queue_reads(&channel, &sim, 10);

    // Sixth read times out
    sim.arm_fault(SIM_INJECT_TIMEOUT, Some(first_wp + 5));
    assert_eq!(sim.step(64), 5);
    assert_eq!(channel.engine().check_abort(), Some(AbortReason::Timeout));

    let salvaged = channel.engine().cleanup_bd_queue(false);
    println!("cleanup_bd_queue -> {:?}", salvaged);
    assert_eq!(salvaged, Some(4));
    assert!(channel.engine().restart_in_progress());

    channel.restart(false).unwrap();
    assert!(!channel.engine().restart_in_progress());

    for (i, ticket) in tickets.iter().take(5).enumerate() {
        assert_eq!(
            channel.poll(*ticket, WAIT),
            PollStatus::Completed(Some(pattern(i as u64).to_vec()))
        );
    }
    assert_eq!(
        channel.poll(tickets[5], WAIT),
        PollStatus::Faulted(AbortReason::Timeout)
    );

    // Only the four after the fault are fetched again
    assert_eq!(sim.step(64), 4);
    for (i, ticket) in tickets.iter().enumerate().skip(6) {
        assert_eq!(
            channel.poll(*ticket, WAIT),
            PollStatus::Completed(Some(pattern(i as u64).to_vec()))
        );
    }

    let stats = channel.stats();
    println!("✓ Salvaged after fault: {:?}", stats);
    assert_eq!(stats.completed, 9);
    assert_eq!(stats.faulted, 1);
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.queue_depth, 0);
}

#[test]
fn test_outstanding_count_after_fault() {
    let channel = ChannelBuilder::new()
        .with_capacity(32)
        .with_sim_config(SimConfig::manual())
        .with_sync_timeout(Duration::from_millis(1))
        .open(0, 1)
        .unwrap();
    let sim = channel.simulator().unwrap().clone();
    let (_, first_wp) = channel.engine().write_state();

    // Synchronous reads give up waiting on a stopped simulator; their
    // tickets stay live and are collected below
    let tickets: Vec<Ticket> = (0..10u64)
        .map(|i| {
            assert!(sim.remote_write(DEST, i * 8, &pattern(i)));
            channel
                .submit_read(DEST, i * 8, Payload::Len(8), SubmitMode::Sync)
                .unwrap()
                .unwrap()
        })
        .collect();
    assert_eq!(channel.queue_depth(), 10);

    // W = 10 submitted, R = 6: W - R - 1 left behind the fault
    sim.arm_fault(SIM_INJECT_TIMEOUT, Some(first_wp + 6));
    assert_eq!(sim.step(64), 6);
    assert_eq!(channel.engine().check_abort(), Some(AbortReason::Timeout));
    assert_eq!(channel.engine().cleanup_bd_queue(false), Some(3));
    channel.restart(false).unwrap();

    for (i, ticket) in tickets.iter().take(6).enumerate() {
        assert_eq!(
            channel.poll(*ticket, WAIT),
            PollStatus::Completed(Some(pattern(i as u64).to_vec()))
        );
    }
    assert_eq!(
        channel.poll(tickets[6], WAIT),
        PollStatus::Faulted(AbortReason::Timeout)
    );
    assert_eq!(sim.step(64), 3);
    for (i, ticket) in tickets.iter().enumerate().skip(7) {
        assert_eq!(
            channel.poll(*ticket, WAIT),
            PollStatus::Completed(Some(pattern(i as u64).to_vec()))
        );
    }
}

#[test]
fn test_scanner_thread_recovers_without_drain_grace() {
    let channel = ChannelBuilder::new()
        .with_capacity(32)
        .with_sim_config(SimConfig::manual())
        .with_scanner_thread(true)
        .with_drain_grace(Duration::from_millis(400))
        .open(0, 1)
        .unwrap();
    let sim = channel.simulator().unwrap().clone();
    let (_, first_wp) = channel.engine().write_state();
    let tickets = queue_writes(&channel, 0, 4);

    sim.arm_fault(SIM_INJECT_TIMEOUT, Some(first_wp + 2));
    assert_eq!(sim.step(64), 2);

    let start = std::time::Instant::now();
    assert_eq!(
        channel.poll(tickets[2], Duration::from_secs(2)),
        PollStatus::Faulted(AbortReason::Timeout)
    );
    let took = start.elapsed();
    println!("scanner-thread recovery took {:?}", took);
    // The scanner thread is the only scanner; it must not wait on itself
    assert!(took < Duration::from_millis(200), "recovery took {took:?}");

    assert_eq!(sim.step(64), 1);
    for t in [tickets[0], tickets[1], tickets[3]] {
        assert_eq!(channel.poll(t, Duration::from_secs(2)), PollStatus::Completed(None));
    }
    assert_eq!(channel.stats().restarts, 1);
}

#[test]
fn test_cleanup_on_running_channel_leaves_it_usable() {
    let (channel, sim) = manual_channel(16);
    let tickets = queue_writes(&channel, 0, 1);

    // Nothing halted, so there is no plan and no restart underway
    assert_eq!(channel.engine().cleanup_bd_queue(false), None);
    assert!(!channel.engine().restart_in_progress());

    assert_eq!(sim.step(64), 1);
    assert_eq!(channel.poll(tickets[0], WAIT), PollStatus::Completed(None));
    assert_eq!(channel.stats().restarts, 0);
    println!("✓ Declined cleanup keeps the scanner running");
}

#[test]
fn test_fault_recovered_while_polling() {
    let (channel, sim) = manual_channel(32);
    let (_, first_wp) = channel.engine().write_state();
    let tickets = queue_reads(&channel, &sim, 6);

    sim.arm_fault(SIM_INJECT_TIMEOUT, Some(first_wp + 2));
    assert_eq!(sim.step(64), 2);

    // Polling notices the abort and restarts on its own
    assert_eq!(
        channel.poll(tickets[2], WAIT),
        PollStatus::Faulted(AbortReason::Timeout)
    );
    assert_eq!(channel.stats().restarts, 1);
    assert_eq!(channel.engine().check_abort(), None);

    assert_eq!(sim.step(64), 3);
    for (i, ticket) in tickets.iter().enumerate() {
        if i == 2 {
            continue;
        }
        assert_eq!(
            channel.poll(*ticket, WAIT),
            PollStatus::Completed(Some(pattern(i as u64).to_vec()))
        );
    }
    println!("✓ Poll-driven recovery: {:?}", channel.stats());
}

#[test]
fn test_fault_at_first_slot_uses_wrap_link() {
    let capacity = 8;
    let (channel, sim) = manual_channel(capacity);

    // Fill slots 1..=6 and let them finish so the next lap starts at slot 0
    for ticket in queue_writes(&channel, 0, 6) {
        sim.step(64);
        assert_eq!(channel.poll(ticket, WAIT), PollStatus::Completed(None));
    }
    assert_eq!(channel.engine().write_state().0, 0);

    let tickets = queue_writes(&channel, 6, 2);
    sim.arm_fault(SIM_INJECT_TIMEOUT, None);
    assert_eq!(sim.step(64), 0);

    assert_eq!(channel.engine().cleanup_bd_queue(false), Some(1));
    // The wrap LINK now skips the failed slot
    let wrap = channel.engine().ring().read(capacity - 1);
    assert_eq!(wrap.local, channel.engine().ring().slot_bus(1));

    channel.restart(false).unwrap();
    assert_eq!(
        channel.poll(tickets[0], WAIT),
        PollStatus::Faulted(AbortReason::Timeout)
    );
    assert_eq!(sim.step(64), 1);
    assert_eq!(channel.poll(tickets[1], WAIT), PollStatus::Completed(None));
    assert_eq!(channel.queue_depth(), 0);

    // Another full lap puts the wrap LINK back to slot 0
    for ticket in queue_writes(&channel, 8, 6) {
        sim.step(64);
        assert_eq!(channel.poll(ticket, WAIT), PollStatus::Completed(None));
    }
    assert_eq!(
        channel.engine().ring().read(capacity - 1).local,
        channel.engine().ring().slot_bus(0)
    );
    assert_eq!(channel.queue_depth(), 0);
    println!("✓ Boundary fault handled: {:?}", channel.stats());
}

#[test]
fn test_submissions_between_cleanup_and_restart() {
    let (channel, sim) = manual_channel(32);
    let (_, first_wp) = channel.engine().write_state();
    let mut tickets = queue_writes(&channel, 0, 10);

    sim.arm_fault(SIM_INJECT_TIMEOUT, Some(first_wp + 5));
    sim.step(64);
    assert_eq!(channel.engine().cleanup_bd_queue(false), Some(4));

    // Arrive while the restart flag is up
    tickets.extend(queue_writes(&channel, 10, 2));
    channel.restart(false).unwrap();

    assert_eq!(sim.step(64), 6);
    for (i, ticket) in tickets.into_iter().enumerate() {
        let expected = if i == 5 {
            PollStatus::Faulted(AbortReason::Timeout)
        } else {
            PollStatus::Completed(None)
        };
        assert_eq!(channel.poll(ticket, WAIT), expected, "ticket {i}");
    }
    assert_eq!(channel.queue_depth(), 0);
    println!("✓ Late submissions survived the restart");
}

#[test]
fn test_restart_without_fault_resumes_queue() {
    let (channel, sim) = manual_channel(32);
    let tickets = queue_writes(&channel, 0, 4);
    assert_eq!(sim.step(2), 2);

    // No plan staged: suspend, salvage, resume
    channel.restart(false).unwrap();
    assert_eq!(channel.stats().restarts, 1);

    assert_eq!(sim.step(64), 2);
    for ticket in tickets {
        assert_eq!(channel.poll(ticket, WAIT), PollStatus::Completed(None));
    }
    assert_eq!(channel.stats().completed, 4);
    println!("✓ Suspend-and-resume restart kept all work");
}

#[test]
fn test_nuke_cancels_everything_queued() {
    let (channel, sim) = manual_channel(32);
    let tickets = queue_writes(&channel, 0, 3);

    channel.restart(true).unwrap();
    for ticket in tickets {
        assert_eq!(
            channel.poll(ticket, WAIT),
            PollStatus::Faulted(AbortReason::Cancelled)
        );
    }
    assert_eq!(channel.queue_depth(), 0);
    assert_eq!(channel.engine().write_state(), (1, 1));

    let ticket = queue_writes(&channel, 3, 1)[0];
    assert_eq!(sim.step(64), 1);
    assert_eq!(channel.poll(ticket, WAIT), PollStatus::Completed(None));
    println!("✓ Nuke restart: {:?}", channel.stats());
}

#[test]
fn test_remote_error_surfaces_from_read() {
    let channel = ChannelBuilder::new().with_capacity(16).open(0, 2).unwrap();

    // Past the end of the modelled remote window
    let err = channel
        .read(DEST, 1 << 21, 8, Duration::from_secs(1))
        .unwrap_err();
    assert!(
        matches!(err, DmaError::HardwareAbort(AbortReason::RemoteIoError)),
        "got {err:?}"
    );

    // The channel came back by itself
    channel
        .submit_write(DEST, 0, Payload::Bytes(b"ok"), SubmitMode::Sync)
        .unwrap();
    assert_eq!(channel.read(DEST, 0, 2, Duration::from_secs(1)).unwrap(), b"ok");
    println!("✓ Remote error reported and recovered: {:?}", channel.stats());
}

#[test]
fn test_injected_remote_error() {
    let (channel, sim) = manual_channel(16);
    let tickets = queue_writes(&channel, 0, 3);

    assert_eq!(sim.simulate_progress(64, SIM_INJECT_RIO_ERR), 0);
    assert_eq!(
        channel.poll(tickets[0], WAIT),
        PollStatus::Faulted(AbortReason::RemoteIoError)
    );
    assert_eq!(sim.step(64), 2);
    assert_eq!(channel.poll(tickets[1], WAIT), PollStatus::Completed(None));
    assert_eq!(channel.poll(tickets[2], WAIT), PollStatus::Completed(None));
}

#[test]
fn test_close_cancels_outstanding() {
    let (channel, _sim) = manual_channel(16);
    let tickets = queue_writes(&channel, 0, 2);

    channel.close();
    for ticket in tickets {
        assert_eq!(
            channel.poll(ticket, WAIT),
            PollStatus::Faulted(AbortReason::Cancelled)
        );
    }
    let err = channel
        .submit_write(DEST, 0, Payload::Bytes(b"x"), SubmitMode::Async)
        .unwrap_err();
    assert!(matches!(err, DmaError::Closed));
}
