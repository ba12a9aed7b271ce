//! # End-to-End Load Generator
//!
//! Purpose: drive a running hkv-server instance over the wire the way a real
//! client population would, so pool elasticity, backpressure, and tail
//! latency can be observed under load rather than inferred from the engine
//! microbenchmark alone.
//!
//! ## Design Principles
//! 1. **Real wire, real pool**: every operation goes through `hkv-client`
//!    over TCP, exercising the reactor and thread pool exactly as a
//!    production client would.
//! 2. **Deterministic workload**: a fixed PRNG seed per worker keeps runs
//!    comparable across invocations.
//! 3. **Shared histogram**: all workers record into one latency histogram so
//!    the report reflects the whole run, not per-worker fragments.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use hkv_client::{ClientConfig, KVClient};
use hkv_server::metrics::LatencyHistogram;

#[derive(Debug, Parser)]
#[command(name = "hkv-bench", about = "End-to-end load generator for hkv-server")]
struct Args {
    /// Address of a running hkv-server instance.
    #[arg(long, default_value = "127.0.0.1:11311")]
    addr: String,

    /// Number of concurrent client workers.
    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// Operations issued per worker.
    #[arg(long, default_value_t = 50_000)]
    ops_per_worker: usize,

    /// Number of distinct keys in the working set.
    #[arg(long, default_value_t = 4_096)]
    key_count: usize,

    /// Value size in bytes.
    #[arg(long, default_value_t = 128)]
    value_size: usize,

    /// Percentage of operations that are GETs (the rest are SETs), 0-100.
    #[arg(long, default_value_t = 90)]
    read_pct: u8,
}

/// Tiny deterministic PRNG, matching the one the engine microbenchmark uses.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_index(&mut self, count: usize) -> usize {
        (self.next_u64() as usize) % count
    }

    fn next_percent(&mut self) -> u8 {
        (self.next_u64() % 100) as u8
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> anyhow::Result<()> {
    let histogram = Arc::new(LatencyHistogram::new(
        hkv_server::metrics::DEFAULT_LATENCY_BUCKETS_US.to_vec(),
    ));
    let errors = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(args.workers));

    println!(
        "hkv-bench: addr={}, workers={}, ops_per_worker={}, keys={}, value_size={}, read_pct={}",
        args.addr, args.workers, args.ops_per_worker, args.key_count, args.value_size, args.read_pct,
    );

    let mut handles = Vec::with_capacity(args.workers);
    let start = Instant::now();
    for worker_id in 0..args.workers {
        let addr = args.addr.clone();
        let histogram = Arc::clone(&histogram);
        let errors = Arc::clone(&errors);
        let barrier = Arc::clone(&barrier);
        let key_count = args.key_count;
        let value_size = args.value_size;
        let read_pct = args.read_pct;
        let ops = args.ops_per_worker;

        handles.push(thread::spawn(move || {
            worker_loop(worker_id, addr, key_count, value_size, read_pct, ops, histogram, errors, barrier)
        }));
    }

    for handle in handles {
        handle.join().expect("worker thread panicked")?;
    }
    let elapsed = start.elapsed();

    report(&histogram, errors.load(Ordering::Relaxed), args.workers * args.ops_per_worker, elapsed);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    worker_id: usize,
    addr: String,
    key_count: usize,
    value_size: usize,
    read_pct: u8,
    ops: usize,
    histogram: Arc<LatencyHistogram>,
    errors: Arc<AtomicUsize>,
    barrier: Arc<Barrier>,
) -> anyhow::Result<()> {
    let client = KVClient::with_config(ClientConfig {
        addr,
        max_idle: 1,
        max_total: 1,
        read_timeout: Some(Duration::from_secs(5)),
        write_timeout: Some(Duration::from_secs(5)),
        connect_timeout: Some(Duration::from_secs(5)),
    })?;

    let value = vec![b'x'; value_size];
    let mut rng = XorShift64::new(0x9E37_79B9_7F4A_7C15 ^ (worker_id as u64));

    // Make sure every worker is connected before timing starts.
    barrier.wait();

    for _ in 0..ops {
        let key = format!("key:{}", rng.next_index(key_count));
        let started = Instant::now();
        let ok = if rng.next_percent() < read_pct {
            client.get(key.as_bytes()).is_ok()
        } else {
            client.set(key.as_bytes(), &value).is_ok()
        };
        histogram.record(started.elapsed());
        if !ok {
            errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    Ok(())
}

fn report(histogram: &LatencyHistogram, errors: usize, total_ops: usize, elapsed: Duration) {
    let snap = histogram.snapshot();
    let secs = elapsed.as_secs_f64();
    println!(
        "completed {total_ops} ops in {secs:.3}s ({:.0} ops/s), errors={errors}",
        total_ops as f64 / secs
    );
    if snap.samples > 0 {
        println!("mean latency: {:.1}us", snap.sum_us as f64 / snap.samples as f64);
    }
    for (bound, count) in snap.bounds_us.iter().zip(snap.buckets.iter()) {
        println!("  <= {bound}us: {count}");
    }
    if let Some(overflow) = snap.buckets.last() {
        println!("  > {}us: {overflow}", snap.bounds_us.last().copied().unwrap_or(0));
    }
}
