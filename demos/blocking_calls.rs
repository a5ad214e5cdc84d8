//! Blocking Calls - offloading a synchronous data-access layer
//!
//! A stand-in for a JDBC-style driver: every query blocks its thread. The
//! dispatcher moves those calls off the caller, and the reactive types
//! compose them without nested callbacks.
//!
//! Scenario:
//! 1. Fire a batch of point lookups through `Dispatcher::execute`
//! 2. Chain a dependent lookup with `Unum::transform_to_unum`
//! 3. Stream a table scan as a `Vecta`, page by page
//! 4. Fall back on a replica when the primary fails
//!
//! Usage:
//!   cargo run --release --example blocking_calls -- [options]
//!
//! Options:
//!   --lookups <N>    Point lookups to fire (default: 200)
//!   --latency <MS>   Simulated query latency (default: 5)

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ordo::reactive::Emitter;
use ordo::{Dispatcher, DispatcherConfig, Error, Unum, Vecta};

/// A row from the `accounts` table.
#[derive(Debug, Clone)]
struct Account {
    id: u64,
    owner: String,
    region_id: u32,
}

/// Synchronous fake database; every call sleeps for `latency`.
struct BlockingDb {
    accounts: HashMap<u64, Account>,
    regions: HashMap<u32, &'static str>,
    latency: Duration,
    primary_up: bool,
}

impl BlockingDb {
    fn seeded(rows: u64, latency: Duration) -> Self {
        let accounts = (0..rows)
            .map(|id| {
                (
                    id,
                    Account {
                        id,
                        owner: format!("user-{id}"),
                        region_id: (id % 3) as u32,
                    },
                )
            })
            .collect();
        let regions = HashMap::from([(0, "eu-west"), (1, "us-east"), (2, "ap-south")]);
        Self {
            accounts,
            regions,
            latency,
            primary_up: false,
        }
    }

    fn find_account(&self, id: u64) -> Result<Account, Error> {
        thread::sleep(self.latency);
        self.accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::msg(format!("no account with id {id}")))
    }

    fn region_name(&self, region_id: u32) -> Result<&'static str, Error> {
        thread::sleep(self.latency);
        self.regions
            .get(&region_id)
            .copied()
            .ok_or_else(|| Error::msg(format!("unknown region {region_id}")))
    }

    fn scan_page(&self, offset: u64, limit: u64) -> Vec<Account> {
        thread::sleep(self.latency);
        (offset..offset + limit)
            .filter_map(|id| self.accounts.get(&id).cloned())
            .collect()
    }

    fn count_on_primary(&self) -> Result<usize, Error> {
        thread::sleep(self.latency);
        if self.primary_up {
            Ok(self.accounts.len())
        } else {
            Err(Error::msg("primary: connection refused"))
        }
    }

    fn count_on_replica(&self) -> usize {
        thread::sleep(self.latency * 2);
        self.accounts.len()
    }
}

struct DemoConfig {
    lookups: u64,
    latency_ms: u64,
}

fn parse_args() -> DemoConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = DemoConfig {
        lookups: 200,
        latency_ms: 5,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--lookups" => {
                if i + 1 < args.len() {
                    config.lookups = args[i + 1].parse().unwrap_or(200);
                    i += 1;
                }
            }
            "--latency" => {
                if i + 1 < args.len() {
                    config.latency_ms = args[i + 1].parse().unwrap_or(5);
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    config
}

fn run(config: &DemoConfig) -> ordo::Result<()> {
    let db = Arc::new(BlockingDb::seeded(
        1_000,
        Duration::from_millis(config.latency_ms),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherConfig::from_env()?.capacity(1024),
    )?);

    // 1. Batch of point lookups: wall time ≈ one query, not N
    println!("📦 {} point lookups", config.lookups);
    let start = Instant::now();
    let handles: Vec<_> = (0..config.lookups)
        .map(|id| {
            let db = Arc::clone(&db);
            dispatcher.try_execute(move || db.find_account(id))
        })
        .collect();
    let mut found = 0;
    for handle in handles {
        if handle.wait().is_ok() {
            found += 1;
        }
    }
    println!("   found {} in {:?}\n", found, start.elapsed());

    // 2. Dependent lookup: account -> region name
    println!("🔗 Dependent lookup");
    let (db1, db2) = (Arc::clone(&db), Arc::clone(&db));
    let scheduler = Arc::clone(&dispatcher);
    let label = Unum::from_result(move || db1.find_account(42))
        .run_on(Arc::clone(&dispatcher))
        .transform_to_unum(move |account| {
            Unum::from_result(move || db2.region_name(account.region_id))
                .run_on(scheduler)
                .transform(move |region| format!("{} lives in {}", account.owner, region))
        })
        .block()?;
    println!("   {}\n", label);

    // 3. Paged scan as a stream; stops fetching once enough rows arrived
    println!("📜 Paged scan (first 25 owners in eu-west)");
    let scan_db = Arc::clone(&db);
    let owners = Vecta::from_generator(move |emitter: &mut Emitter<Account>| {
        let mut offset = 0;
        loop {
            let page = scan_db.scan_page(offset, 50);
            if page.is_empty() {
                return Ok(());
            }
            offset += page.len() as u64;
            for account in page {
                if !emitter.emit(account) {
                    return Ok(());
                }
            }
        }
    })
    .filter(|account| account.region_id == 0)
    .transform(|account| (account.id, account.owner))
    .take(25)
    .run_on(Arc::clone(&dispatcher))
    .block_collect()?;
    println!(
        "   got {} rows, last = {:?}\n",
        owners.len(),
        owners.last()
    );

    // 4. Primary down: recover on the replica
    println!("🛟 Failover");
    let (primary, replica) = (Arc::clone(&db), Arc::clone(&db));
    let fallback_scheduler = Arc::clone(&dispatcher);
    let count = Unum::from_result(move || primary.count_on_primary())
        .run_on(Arc::clone(&dispatcher))
        .invoke_failure(|e| println!("   primary failed: {e}"))
        .recover_with_unum(move |_| {
            Unum::from(move || replica.count_on_replica()).run_on(fallback_scheduler)
        })
        .block()?;
    println!("   {} accounts (from replica)\n", count);

    let stats = dispatcher.stats();
    println!(
        "📊 Dispatcher: submitted {} / queued {} / inline {} / failed {}",
        stats.submitted, stats.queued, stats.ran_inline, stats.failed
    );
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ordo=info,warn")),
        )
        .init();

    let config = parse_args();
    if let Err(e) = run(&config) {
        eprintln!("❌ Demo failed: {}", e);
        std::process::exit(1);
    }
}
