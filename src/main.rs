//! Ordo Bench - latency / throughput report for the dispatch core
//!
//! Measures:
//! - Ring buffer offer/poll latency (uncontended)
//! - Multi-producer throughput into a single consumer
//! - Dispatcher round trips, including inline fallback under overload
//! - Reactive pipeline overhead on top of the dispatcher
//!
//! Usage:
//!   cargo run --release --bin ordo_bench [OPTIONS]

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use ordo::core::RingBuffer;
use ordo::{Dispatcher, DispatcherConfig, Unum, Vecta};

/// Benchmark configuration
struct BenchConfig {
    iterations: usize,
    producers: usize,
    capacity: Option<usize>,
    verbose: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 1_000_000,
            producers: 4,
            capacity: None,
            verbose: false,
        }
    }
}

fn benchmark_ring_buffer(config: &BenchConfig) -> ordo::Result<()> {
    println!("📊 Ring Buffer Benchmark (uncontended)");
    println!("--------------------------------------");

    let iterations = config.iterations;
    let mut rb: RingBuffer<u64> = RingBuffer::new(65_536)?;

    // Warm up
    for i in 0..1000 {
        rb.offer(i);
    }
    while rb.poll().is_some() {}

    let start = Instant::now();
    for i in 0..iterations {
        if !rb.offer(i as u64) {
            rb.poll();
            rb.offer(i as u64);
        }
    }
    let offer_duration = start.elapsed();

    while rb.poll().is_some() {}
    for i in 0..rb.capacity() {
        rb.offer(i as u64);
    }

    let start = Instant::now();
    for _ in 0..iterations {
        if let Some(v) = rb.poll() {
            rb.offer(v);
        }
    }
    let cycle_duration = start.elapsed();

    let offer_ns = offer_duration.as_nanos() as f64 / iterations as f64;
    let cycle_ns = cycle_duration.as_nanos() as f64 / iterations as f64;

    println!("  Operations:      {}", iterations);
    println!("  Offer latency:   {:.2} ns/op", offer_ns);
    println!("  Poll+offer:      {:.2} ns/op", cycle_ns);
    println!(
        "  Throughput:      {:.2} M ops/sec\n",
        iterations as f64 / offer_duration.as_secs_f64() / 1_000_000.0
    );
    Ok(())
}

fn benchmark_contended(config: &BenchConfig) -> ordo::Result<()> {
    println!(
        "📊 MPSC Benchmark ({} producers → 1 consumer)",
        config.producers
    );
    println!("---------------------------------------------");

    let per_producer = config.iterations / config.producers.max(1);
    let total = per_producer * config.producers;
    let (producer, mut consumer) = RingBuffer::<u64>::new(4096)?.split();

    let start = Instant::now();
    let workers: Vec<_> = (0..config.producers)
        .map(|_| {
            let producer = producer.clone();
            thread::spawn(move || {
                for i in 0..per_producer as u64 {
                    let mut value = i;
                    // Spin on a full ring; the consumer is draining
                    while let Err(rejected) = producer.try_offer(value) {
                        value = rejected;
                        std::hint::spin_loop();
                    }
                }
            })
        })
        .collect();
    drop(producer);

    let mut batch = Vec::with_capacity(256);
    let mut received = 0usize;
    while received < total {
        let n = consumer.poll_batch(&mut batch, 256);
        batch.clear();
        if n == 0 {
            std::hint::spin_loop();
        }
        received += n;
    }
    let duration = start.elapsed();

    for worker in workers {
        let _ = worker.join();
    }

    println!("  Items:       {}", total);
    println!("  Elapsed:     {:.2} ms", duration.as_secs_f64() * 1000.0);
    println!(
        "  Throughput:  {:.2} M items/sec\n",
        total as f64 / duration.as_secs_f64() / 1_000_000.0
    );
    Ok(())
}

fn benchmark_dispatcher(config: &BenchConfig, dispatcher: &Dispatcher) -> ordo::Result<()> {
    println!("📊 Dispatcher Benchmark (execute → wait)");
    println!("----------------------------------------");

    let tasks = (config.iterations / 10).max(1);

    let start = Instant::now();
    let handles: Vec<_> = (0..tasks as u64)
        .map(|i| dispatcher.execute(move || i.wrapping_mul(31)))
        .collect();
    let submit_duration = start.elapsed();

    let mut checksum = 0u64;
    for handle in handles {
        checksum = checksum.wrapping_add(handle.wait()?);
    }
    let total_duration = start.elapsed();

    let stats = dispatcher.stats();
    println!("  Tasks:          {}", tasks);
    println!(
        "  Submit latency: {:.2} ns/task",
        submit_duration.as_nanos() as f64 / tasks as f64
    );
    println!(
        "  Round trip:     {:.2} μs/task",
        total_duration.as_micros() as f64 / tasks as f64
    );
    println!("  Queued:         {}", stats.queued);
    println!("  Ran inline:     {}", stats.ran_inline);
    if config.verbose {
        println!("  Checksum:       {}", checksum);
    }
    println!();
    Ok(())
}

fn benchmark_pipeline(config: &BenchConfig, dispatcher: &Arc<Dispatcher>) -> ordo::Result<()> {
    println!("📊 Reactive Pipeline Benchmark");
    println!("------------------------------");

    let rounds = (config.iterations / 100).max(1);

    let start = Instant::now();
    for i in 0..rounds {
        Unum::from(move || i)
            .run_on(Arc::clone(dispatcher))
            .transform(|n| n + 1)
            .block()?;
    }
    let unum_duration = start.elapsed();

    let start = Instant::now();
    let rows = Vecta::from_iterable(0..config.iterations as u64)
        .filter(|n| n % 2 == 0)
        .transform(|n| n * 3)
        .run_on(Arc::clone(dispatcher))
        .block_collect()?;
    let vecta_duration = start.elapsed();

    println!(
        "  Unum round trip:   {:.2} μs/op ({} ops)",
        unum_duration.as_micros() as f64 / rounds as f64,
        rounds
    );
    println!(
        "  Vecta throughput:  {:.2} M items/sec ({} items out)",
        config.iterations as f64 / vecta_duration.as_secs_f64() / 1_000_000.0,
        rows.len()
    );
    Ok(())
}

fn run(config: BenchConfig) -> ordo::Result<()> {
    println!("🚀 Ordo Dispatch Core - Benchmarks");
    println!("==================================\n");

    benchmark_ring_buffer(&config)?;
    benchmark_contended(&config)?;

    let mut dispatcher_config = DispatcherConfig::from_env()?;
    if let Some(capacity) = config.capacity {
        dispatcher_config = dispatcher_config.capacity(capacity);
    }
    let dispatcher = Arc::new(Dispatcher::new(dispatcher_config)?);

    benchmark_dispatcher(&config, &dispatcher)?;
    benchmark_pipeline(&config, &dispatcher)?;

    println!("\n✅ All benchmarks complete!");
    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ordo={level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

fn parse_args() -> BenchConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = BenchConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--iterations" | "-n" => {
                if i + 1 < args.len() {
                    config.iterations = args[i + 1].parse().unwrap_or(1_000_000);
                    i += 1;
                }
            }
            "--producers" | "-p" => {
                if i + 1 < args.len() {
                    config.producers = args[i + 1].parse().unwrap_or(4);
                    i += 1;
                }
            }
            "--capacity" | "-c" => {
                if i + 1 < args.len() {
                    config.capacity = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                println!("Ordo Bench - dispatch core benchmarks\n");
                println!("Usage: ordo_bench [OPTIONS]\n");
                println!("Options:");
                println!("  -n, --iterations <N>  Operations per benchmark (default: 1000000)");
                println!("  -p, --producers <N>   Producer threads for MPSC run (default: 4)");
                println!("  -c, --capacity <N>    Dispatcher queue capacity (default: ORDO_QUEUE_CAPACITY or 65536)");
                println!("  -v, --verbose         Debug logging");
                println!("  -h, --help            Show this help");
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

fn main() {
    let config = parse_args();
    init_tracing(config.verbose);

    if let Err(e) = run(config) {
        eprintln!("❌ Benchmark error: {}", e);
        std::process::exit(1);
    }
}
