//! Basic dispatch example
//!
//! Walks through serial and concurrent queues, a barrier, a group
//! notification on the main queue, `apply`, and a data source.
//!
//! # Environment Variables
//!
//! - `RUST_LOG=dispatch_runtime=debug` - Show runtime thread lifecycle
//! - `DISPATCH_NUM_WORKERS=4` - Pool size (see `RuntimeConfig::from_env`)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use dispatch::prelude::*;
use dispatch::RuntimeConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

// RUST_LOG=debug cargo run -p dispatch-basic
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Dispatch Basic Example ===\n");

    let config = RuntimeConfig::from_env();
    config.print();
    if let Err(e) = dispatch::init(config) {
        eprintln!("init failed: {}", e);
        std::process::exit(1);
    }

    // Serial queue: items run one at a time, in order
    let serial = Queue::serial("com.example.serial");
    let group = Group::new();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..1000 {
        let c = Arc::clone(&counter);
        serial.submit_in_group(&group, move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
    }
    group.wait();
    info!(count = counter.load(Ordering::Relaxed), "serial queue drained");

    // Concurrent queue split by a barrier
    let concurrent = Queue::concurrent("com.example.concurrent");
    let phase = Arc::new(AtomicUsize::new(0));
    for i in 0..10 {
        let p = Arc::clone(&phase);
        concurrent.submit_in_group(&group, move || {
            std::thread::sleep(Duration::from_millis(5));
            info!(item = i, phase = p.load(Ordering::SeqCst), "before barrier");
        });
    }
    let p = Arc::clone(&phase);
    concurrent.submit_barrier(move || {
        p.store(1, Ordering::SeqCst);
        info!("barrier");
    });
    for i in 0..10 {
        let p = Arc::clone(&phase);
        concurrent.submit_in_group(&group, move || {
            info!(item = i, phase = p.load(Ordering::SeqCst), "after barrier");
        });
    }

    // Continuation on the main queue once everything above finished
    let (done_tx, done_rx) = mpsc::channel();
    group.notify(&dispatch::main_queue(), move || {
        info!(thread = ?std::thread::current().name(), "group finished");
        let _ = done_tx.send(());
    });
    let _ = done_rx.recv_timeout(Duration::from_secs(10));

    // Parallel loop
    let start = Instant::now();
    let sum = AtomicUsize::new(0);
    dispatch::concurrent_perform(10_000, |i| {
        sum.fetch_add(i, Ordering::Relaxed);
    });
    info!(sum = sum.load(Ordering::Relaxed), elapsed = ?start.elapsed(), "apply finished");

    // User-data source coalescing merges
    let source = Source::data_add(Some(&serial));
    let s = source.clone();
    source.set_event_handler(move || info!(data = s.data(), "data source fired"));
    let (cancel_tx, cancel_rx) = mpsc::channel();
    source.set_cancel_handler(move || {
        let _ = cancel_tx.send(());
    });
    source.activate();
    for n in 1..=10 {
        source.merge_data(n);
    }
    std::thread::sleep(Duration::from_millis(20));
    source.cancel();
    let _ = cancel_rx.recv_timeout(Duration::from_secs(5));

    let stats = dispatch::runtime().stats();
    println!("\n=== Example Complete ===");
    println!(
        "threads={} executed={} spawned={} retired={}",
        stats.pool.threads, stats.pool.executed, stats.pool.spawned, stats.pool.retired
    );
}
