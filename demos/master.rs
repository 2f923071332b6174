// Master side of a shared DMA channel.
// Run with: cargo run --example master -- [channel_name] [--auto-exit]
use fabric_dma::{ChannelBuilder, PollStrategy};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() -> fabric_dma::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let name = args
        .get(1)
        .filter(|a| !a.starts_with("--"))
        .cloned()
        .unwrap_or_else(|| "fdma_demo".to_string());
    let auto_exit = args.iter().any(|a| a == "--auto-exit");

    let channel = ChannelBuilder::new()
        .with_capacity(256)
        .with_max_clients(8)
        .with_channel(0, 0)
        .with_poll_strategy(PollStrategy::Sleep(Duration::from_micros(10)))
        .with_scanner_thread(true)
        .create_shared(&name)?;

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = Arc::clone(&running);

    // Handle Ctrl+C to clean up
    ctrlc::set_handler(move || {
        running_for_handler.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");

    println!("Master: serving channel '{}' (pid {})", name, std::process::id());
    if auto_exit {
        println!("Master: auto-exit mode, shutting down after 10 seconds");
    } else {
        println!("Press Ctrl+C to exit...");
    }

    let started = Instant::now();
    let mut last = channel.stats();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));

        let stats = channel.stats();
        if stats != last {
            println!(
                "Master: submitted {} completed {} faulted {} restarts {} depth {}",
                stats.submitted, stats.completed, stats.faulted, stats.restarts, stats.queue_depth
            );
            last = stats;
        }
        if auto_exit && started.elapsed() >= Duration::from_secs(10) {
            break;
        }
    }

    println!("Master: Shutting down");
    channel.close();
    Ok(())
}
