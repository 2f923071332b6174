// Cross-process channel, exercised with master and clients in one
// process. Each test uses its own /dev/shm name; serial because the
// simulator maps client buffers by name.
// Run with: cargo test --test shared_channel -- --nocapture

#[cfg(target_os = "linux")]
mod linux_tests {
    use fabric_dma::DMA::ChannelRole;
    use fabric_dma::{
        AbortReason, Channel, ChannelBuilder, DmaError, Payload, PollStatus, SubmitMode,
    };
    use serial_test::serial;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const DEST: u16 = 2;
    const WAIT: Duration = Duration::from_secs(2);

    fn channel_name(test: &str) -> String {
        format!("fdma_test_{}_{}", test, std::process::id())
    }

    fn master(name: &str, max_clients: u32) -> Channel {
        ChannelBuilder::new()
            .with_capacity(64)
            .with_max_clients(max_clients)
            .with_mailbox_capacity(64)
            .with_channel(1, 2)
            .with_scanner_thread(true)
            .create_shared(name)
            .unwrap()
    }

    #[test]
    #[serial]
    fn test_client_round_trip() {
        let name = channel_name("round_trip");
        let master = master(&name, 4);
        assert_eq!(master.role(), ChannelRole::Master);

        let client = ChannelBuilder::new().attach_shared(&name).unwrap();
        assert_eq!(client.role(), ChannelRole::Client);
        assert_eq!(client.client_index(), Some(0));

        let ticket = client
            .submit_write(DEST, 0x10, Payload::Bytes(b"from client"), SubmitMode::Async)
            .unwrap()
            .unwrap();
        assert_eq!(client.poll(ticket, WAIT), PollStatus::Completed(None));
        assert_eq!(client.read(DEST, 0x10, 11, WAIT).unwrap(), b"from client");

        // The master sees the same remote memory
        assert_eq!(master.read(DEST, 0x10, 11, WAIT).unwrap(), b"from client");

        let header = master.engine().layout().header();
        assert_eq!((header.port_id, header.channel_id), (1, 2));
        assert!(master.stats().completed >= 3);
        println!("✓ Client round trip: {:?}", master.stats());

        client.close();
        master.close();
    }

    #[test]
    #[serial]
    fn test_client_bulk_buffer() {
        let name = channel_name("bulk");
        let master = master(&name, 2);
        let client = ChannelBuilder::new().attach_shared(&name).unwrap();

        let region = client.alloc_buffer(512).unwrap();
        assert!(region.owned_name().is_some());
        let payload = [0x5Au8; 256];
        region.write(0, &payload).unwrap();

        let ticket = client
            .submit_write(DEST, 0x2000, Payload::Buffer(region.pin(0, 256).unwrap()), SubmitMode::Async)
            .unwrap()
            .unwrap();
        assert_eq!(client.poll(ticket, WAIT), PollStatus::Completed(None));

        let sim = master.simulator().unwrap();
        assert_eq!(sim.remote_read(DEST, 0x2000, 256).unwrap(), payload.to_vec());
        println!("✓ Client buffer moved by the master's engine");
    }

    #[test]
    #[serial]
    fn test_completions_route_to_their_client() {
        let name = channel_name("routing");
        let master = master(&name, 4);
        let a = ChannelBuilder::new().attach_shared(&name).unwrap();
        let b = ChannelBuilder::new().attach_shared(&name).unwrap();
        assert_ne!(a.client_index(), b.client_index());

        let mut ta = Vec::new();
        let mut tb = Vec::new();
        for i in 0..20u64 {
            ta.push(
                a.submit_write(DEST, i * 8, Payload::Bytes(&i.to_le_bytes()), SubmitMode::Async)
                    .unwrap()
                    .unwrap(),
            );
            tb.push(
                b.submit_read(DEST, i * 8, Payload::Len(8), SubmitMode::Async)
                    .unwrap()
                    .unwrap(),
            );
        }
        for t in ta {
            assert_eq!(a.poll(t, WAIT), PollStatus::Completed(None));
        }
        for t in tb {
            assert!(matches!(b.poll(t, WAIT), PollStatus::Completed(Some(_))));
        }
        println!("✓ Two clients each collected their own completions");
    }

    #[test]
    #[serial]
    fn test_client_limits() {
        let name = channel_name("limits");
        let master = master(&name, 1);
        let client = ChannelBuilder::new().attach_shared(&name).unwrap();

        let err = ChannelBuilder::new().attach_shared(&name).unwrap_err();
        assert!(matches!(err, DmaError::NoFreeClientSlot), "got {err:?}");

        assert!(matches!(client.restart(false), Err(DmaError::NotMaster)));
        assert!(matches!(client.reap_dead_clients(), Err(DmaError::NotMaster)));

        // Detaching frees the slot
        client.close();
        let again = ChannelBuilder::new().attach_shared(&name).unwrap();
        assert_eq!(again.client_index(), Some(0));
        drop(again);
        master.close();
    }

    #[test]
    #[serial]
    fn test_dead_client_is_reaped() {
        let name = channel_name("reap");
        // No scanner thread, so nothing reaps behind the test's back
        let master = ChannelBuilder::new()
            .with_max_clients(2)
            .create_shared(&name)
            .unwrap();

        // A pid that has certainly exited
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let entry = master.engine().layout().client(1).unwrap();
        entry.pid.store(dead_pid, Ordering::Release);

        assert_eq!(master.reap_dead_clients().unwrap(), 1);
        assert_eq!(entry.pid.load(Ordering::Acquire), 0);
        assert_eq!(master.reap_dead_clients().unwrap(), 0);
        println!("✓ Reaped slot of dead pid {}", dead_pid);
    }

    #[test]
    #[serial]
    fn test_master_close_stops_clients() {
        let name = channel_name("close");
        let master = master(&name, 2);
        let client = ChannelBuilder::new().attach_shared(&name).unwrap();

        master.close();
        assert!(!std::path::Path::new(&format!("/dev/shm/{name}")).exists());

        let err = client
            .submit_write(DEST, 0, Payload::Bytes(b"late"), SubmitMode::Async)
            .unwrap_err();
        assert!(matches!(err, DmaError::Closed));

        let err = ChannelBuilder::new().attach_shared(&name).unwrap_err();
        println!("✓ Attach after close fails: {}", err);
    }

    #[test]
    #[serial]
    fn test_client_tickets_cancelled_on_detach() {
        let name = channel_name("detach");
        let master = ChannelBuilder::new()
            .with_max_clients(2)
            .with_sim_config(fabric_dma::SimConfig::manual())
            .create_shared(&name)
            .unwrap();
        let client = ChannelBuilder::new().attach_shared(&name).unwrap();

        let ticket = client
            .submit_write(DEST, 0, Payload::Bytes(b"never"), SubmitMode::Async)
            .unwrap()
            .unwrap();
        client.close();
        assert_eq!(
            client.poll(ticket, WAIT),
            PollStatus::Faulted(AbortReason::Cancelled)
        );

        // The master still owns the descriptor and drains it normally
        master.service();
        master.simulator().unwrap().step(64);
        master.service();
        assert_eq!(master.queue_depth(), 0);
    }

    #[test]
    #[serial]
    fn test_client_outstanding_bounded_by_mailbox() {
        let name = channel_name("mailbox_bound");
        let master = ChannelBuilder::new()
            .with_capacity(64)
            .with_max_clients(2)
            .with_mailbox_capacity(8)
            .with_scanner_thread(true)
            .with_sim_config(fabric_dma::SimConfig::manual())
            .create_shared(&name)
            .unwrap();
        let sim = master.simulator().unwrap().clone();
        let client = ChannelBuilder::new().attach_shared(&name).unwrap();

        let submit = |i: u64| {
            client.submit_write(DEST, i * 8, Payload::Bytes(&[i as u8; 8]), SubmitMode::Async)
        };

        // Nothing completes yet: the ninth completion would not fit
        let mut tickets: Vec<_> = (0..8).map(|i| submit(i).unwrap().unwrap()).collect();
        assert!(matches!(submit(8), Err(DmaError::QueueFull)));
        assert_eq!(master.queue_depth(), 8);

        // Keep submitting, letting the hardware catch up whenever the
        // client is told to back off
        let mut i = 8;
        while tickets.len() < 20 {
            match submit(i) {
                Ok(Some(t)) => {
                    tickets.push(t);
                    i += 1;
                }
                Err(DmaError::QueueFull) => {
                    sim.step(64);
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => panic!("unexpected submit result {other:?}"),
            }
        }
        sim.step(64);

        for t in &tickets {
            assert_eq!(client.poll(*t, WAIT), PollStatus::Completed(None));
        }
        assert_eq!(master.stats().completed, 20);
        assert_eq!(master.engine().mailbox(0).unwrap().dropped(), 0);
        println!("✓ 20 client tickets resolved through an 8-entry mailbox");

        client.close();
        master.close();
    }
}
