// Client side of a shared DMA channel. Start the master first.
// Run with: cargo run --example client -- <num_ops> [channel_name]
use fabric_dma::{ChannelBuilder, Payload, PollStatus, SubmitMode};
use std::env;
use std::time::{Duration, Instant};

const DEST_ID: u16 = 1;

fn main() -> fabric_dma::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <num_ops> [channel_name]", args[0]);
        std::process::exit(1);
    }
    let num_ops: u64 = args[1].parse().expect("Invalid number of operations");
    let name = args.get(2).cloned().unwrap_or_else(|| "fdma_demo".to_string());

    let channel = ChannelBuilder::new().attach_shared(&name)?;
    println!(
        "Client: attached to '{}' as client {:?}",
        name,
        channel.client_index()
    );

    let start = Instant::now();
    let mut verified = 0u64;
    let mut failed = 0u64;

    for i in 0..num_ops {
        let raddr = (i % 4096) * 8;
        let value = i.to_le_bytes();

        let write = loop {
            match channel.submit_write(DEST_ID, raddr, Payload::Bytes(&value), SubmitMode::Async) {
                Ok(ticket) => break ticket,
                Err(e) if e.is_retryable() => std::thread::sleep(Duration::from_micros(10)),
                Err(e) => return Err(e),
            }
        };
        if let Some(ticket) = write {
            if let PollStatus::Faulted(reason) = channel.poll(ticket, Duration::from_secs(5)) {
                eprintln!("Client: write {} faulted: {}", i, reason);
                failed += 1;
                continue;
            }
        }

        match channel.read(DEST_ID, raddr, 8, Duration::from_secs(5)) {
            Ok(data) if data == value => verified += 1,
            Ok(data) => {
                eprintln!("Client: read-back mismatch at {:#x}: {:?}", raddr, data);
                failed += 1;
            }
            Err(e) => {
                eprintln!("Client: read {} failed: {}", i, e);
                failed += 1;
            }
        }

        if (i + 1) % 100 == 0 {
            println!("Client: {} operations done", i + 1);
        }
    }

    let elapsed = start.elapsed();
    println!(
        "Client: {} verified, {} failed in {:.2?} ({:.0} round trips/sec)",
        verified,
        failed,
        elapsed,
        (verified * 2) as f64 / elapsed.as_secs_f64()
    );

    channel.close();
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
