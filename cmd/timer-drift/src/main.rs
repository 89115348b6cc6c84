//! Repeating timer accuracy check
//!
//! Runs a repeating timer source and reports how many periods fired and
//! how far the gaps between deliveries strayed from the interval.
//!
//! # Environment Variables
//!
//! - `DRIFT_INTERVAL_MS` - Timer interval (default 10)
//! - `DRIFT_LEEWAY_MS` - Allowed leeway (default 2)
//! - `DRIFT_DURATION_MS` - How long to run (default 1000)
//! - `DRIFT_STRICT=1` - Create the timer with `TimerFlags::STRICT`

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use dispatch::prelude::*;
use dispatch::{env_flag, env_or};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let interval_ms: i64 = env_or("DRIFT_INTERVAL_MS", 10).max(1);
    let leeway_ms: i64 = env_or("DRIFT_LEEWAY_MS", 2);
    let duration_ms: u64 = env_or("DRIFT_DURATION_MS", 1000);
    let flags = if env_flag("DRIFT_STRICT", false) {
        TimerFlags::STRICT
    } else {
        TimerFlags::NONE
    };

    println!("=== Timer Drift ===");
    println!(
        "interval={}ms leeway={}ms duration={}ms strict={}",
        interval_ms,
        leeway_ms,
        duration_ms,
        flags == TimerFlags::STRICT
    );

    let queue = Queue::builder("com.example.timer-drift")
        .qos(Qos::USER_INTERACTIVE)
        .build();
    let timer = Source::timer(flags, Some(&queue));

    // (fire time ns, periods delivered)
    let samples = Arc::new(Mutex::new(Vec::<(u64, u64)>::new()));
    let s = Arc::clone(&samples);
    let t = timer.clone();
    timer.set_event_handler(move || {
        let now = DispatchTime::now().as_nanos();
        if let Ok(mut samples) = s.lock() {
            samples.push((now, t.data()));
        }
    });
    let (cancel_tx, cancel_rx) = mpsc::channel();
    timer.set_cancel_handler(move || {
        let _ = cancel_tx.send(());
    });

    let start = DispatchTime::now().saturating_add(TimeInterval::milliseconds(interval_ms));
    timer.schedule(
        start,
        TimeInterval::milliseconds(interval_ms),
        TimeInterval::milliseconds(leeway_ms),
    );
    timer.activate();
    std::thread::sleep(Duration::from_millis(duration_ms));
    timer.cancel();
    if cancel_rx.recv_timeout(Duration::from_secs(5)).is_err() {
        warn!("cancel handler did not run within 5s");
    }

    let samples = match samples.lock() {
        Ok(samples) => samples.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    let periods: u64 = samples.iter().map(|&(_, n)| n).sum();
    let expected = duration_ms / interval_ms as u64;
    let interval_ns = interval_ms as f64 * 1e6;

    let drifts: Vec<f64> = samples
        .windows(2)
        .filter(|w| w[1].1 == 1)
        .map(|w| (w[1].0.saturating_sub(w[0].0) as f64 - interval_ns).abs())
        .collect();
    let mean_drift_ms = if drifts.is_empty() {
        0.0
    } else {
        drifts.iter().sum::<f64>() / drifts.len() as f64 / 1e6
    };
    let max_drift_ms = drifts.iter().cloned().fold(0.0, f64::max) / 1e6;
    let coalesced = samples.iter().filter(|&&(_, n)| n > 1).count();

    info!(deliveries = samples.len(), periods, expected, coalesced, "timer finished");
    println!("deliveries:     {}", samples.len());
    println!("periods:        {} (expected ~{})", periods, expected);
    println!("coalesced:      {}", coalesced);
    println!("mean |drift|:   {:.3}ms", mean_drift_ms);
    println!("max |drift|:    {:.3}ms", max_drift_ms);
}
