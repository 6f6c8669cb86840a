//! chainpool CLI — exercise a connection pool from the terminal.
//!
//! Usage:
//! ```bash
//! # Drive a pool with simulated node connections
//! chainpool simulate --max-size 4 --workers 16 --rounds 50 --fail-every 7
//!
//! # Print the default pool settings as JSON
//! chainpool config
//!
//! # Validate a settings file
//! chainpool config --file pool.json
//! ```

use std::env;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chainpool_core::{
    fetch_boundary, ChainConnection, ConnectionError, ConnectionFactory, ConnectionPool,
    ContractResponse, PoolConfig, PoolSettings,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "simulate" => cmd_simulate(&args[2..]).await,
        "config" => cmd_config(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("chainpool {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_usage() {
    println!("chainpool {}", env!("CARGO_PKG_VERSION"));
    println!("Exercise a pool of blockchain node connections\n");
    println!("USAGE:");
    println!("    chainpool <COMMAND>\n");
    println!("COMMANDS:");
    println!("    simulate   Run concurrent borrowers against simulated connections");
    println!("    config     Print default settings, or validate a settings file");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("SIMULATE FLAGS:");
    println!("    --max-size <N>      Pool capacity                     [default: 4]");
    println!("    --workers <N>       Concurrent borrowers              [default: 8]");
    println!("    --rounds <N>        Borrows per worker                [default: 20]");
    println!("    --fail-every <N>    Every Nth validation fails (0=never) [default: 0]");
    println!("    --timeout-ms <MS>   Borrow timeout                    [default: 30000]");
    println!("    --hold-ms <MS>      Time each borrow is held          [default: 5]\n");
    println!("CONFIG FLAGS:");
    println!("    --file <PATH>       JSON settings file to validate");
}

/// In-process stand-in for a node client.
struct SimConnection {
    id: u64,
    validations: Arc<AtomicU64>,
    fail_every: u64,
}

#[async_trait]
impl ChainConnection for SimConnection {
    async fn validate(&self) -> bool {
        let n = self.validations.fetch_add(1, Ordering::Relaxed) + 1;
        self.fail_every == 0 || n % self.fail_every != 0
    }

    async fn destroy(&mut self) -> Result<(), ConnectionError> {
        tracing::debug!(conn = self.id, "simulated connection closed");
        Ok(())
    }
}

struct SimFactory {
    next_id: AtomicU64,
    validations: Arc<AtomicU64>,
    fail_every: u64,
}

#[async_trait]
impl ConnectionFactory for SimFactory {
    type Connection = SimConnection;

    async fn create(&self) -> Result<SimConnection, ConnectionError> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(SimConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            validations: Arc::clone(&self.validations),
            fail_every: self.fail_every,
        })
    }

    fn name(&self) -> &str {
        "simulated-node"
    }
}

async fn cmd_simulate(args: &[String]) -> Result<(), String> {
    let max_size: usize = parse_num(args, "--max-size", 4)?;
    let workers: usize = parse_num(args, "--workers", 8)?;
    let rounds: usize = parse_num(args, "--rounds", 20)?;
    let fail_every: u64 = parse_num(args, "--fail-every", 0)?;
    let timeout_ms: u64 = parse_num(args, "--timeout-ms", 30_000)?;
    let hold_ms: u64 = parse_num(args, "--hold-ms", 5)?;

    let config = PoolConfig {
        max_size,
        borrow_timeout: Duration::from_millis(timeout_ms),
        ..Default::default()
    };
    let factory = SimFactory {
        next_id: AtomicU64::new(0),
        validations: Arc::new(AtomicU64::new(0)),
        fail_every,
    };
    let pool = ConnectionPool::new(factory, config).map_err(|e| e.to_string())?;

    println!("Simulating {workers} workers x {rounds} rounds on a pool of {max_size}...");
    let start = Instant::now();

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let mut failures = 0usize;
            for round in 0..rounds {
                let signature = format!("SimResolver::call(worker={worker}, round={round})");
                let outcome = fetch_boundary(&signature, async {
                    let conn = pool.borrow().await?;
                    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                    let response = ContractResponse::constant(vec![serde_json::json!(conn.id)]);
                    pool.release(conn).await;
                    Ok::<_, chainpool_core::PoolError>(response)
                })
                .await;
                if outcome.is_err() {
                    failures += 1;
                }
            }
            failures
        }));
    }

    let mut failures = 0;
    for handle in handles {
        failures += handle.await.map_err(|e| e.to_string())?;
    }
    let elapsed = start.elapsed();
    let stats = pool.stats();
    pool.shutdown().await;
    let closed = pool.stats();

    println!("  Elapsed:             {}ms", elapsed.as_millis());
    println!("  Borrow failures:     {failures}");
    println!("  Connections created: {}", stats.created);
    println!("  Validation failures: {}", stats.validation_failures);
    println!("  Idle at end:         {}", stats.idle);
    println!("  Destroyed (total):   {}", closed.destroyed);
    if closed.leaked > 0 {
        println!("  Leaked:              {}", closed.leaked);
    }
    Ok(())
}

fn cmd_config(args: &[String]) -> Result<(), String> {
    let settings = match parse_flag(args, "--file") {
        Some(path) => {
            let raw = std::fs::read_to_string(&path).map_err(|e| format!("{path}: {e}"))?;
            PoolSettings::from_json_str(&raw).map_err(|e| e.to_string())?
        }
        None => PoolSettings::from(&PoolConfig::default()),
    };
    let config = PoolConfig::try_from(settings.clone()).map_err(|e| e.to_string())?;
    tracing::debug!(?config, "settings accepted");
    println!(
        "{}",
        serde_json::to_string_pretty(&settings).map_err(|e| e.to_string())?
    );
    Ok(())
}

fn parse_num<T: std::str::FromStr>(args: &[String], flag: &str, default: T) -> Result<T, String> {
    match parse_flag(args, flag) {
        Some(raw) => raw.parse().map_err(|_| format!("{flag} expects a number, got '{raw}'")),
        None => Ok(default),
    }
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}
