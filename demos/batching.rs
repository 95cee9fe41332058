use anyhow::Result;
use batch_loader::prelude::*;
use clap::Parser;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;
use tracing::info;
use tracing::instrument;
use tracing_subscriber::EnvFilter;

/// Hammer a slow fake user directory through a batch loader and report what it did.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Number of concurrent workers.
    #[arg(long, default_value_t = 32)]
    workers: usize,

    /// Lookups done by every worker.
    #[arg(long, default_value_t = 50)]
    lookups: usize,

    /// Size of the user id space.
    #[arg(long, default_value_t = 500)]
    users: u32,

    /// Batch wait window, ms.
    #[arg(long, default_value_t = 2, env = "BATCHING_WAIT_MS")]
    wait_ms: u64,

    /// Max keys per batch; 0 = no limit.
    #[arg(long, default_value_t = 64, env = "BATCHING_MAX_BATCH")]
    max_batch: usize,

    /// Simulated backend round-trip, ms.
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,
}

#[derive(Debug, Error)]
#[error("user #{0} is locked")]
struct Missing(u32);

// Every 97th user is "locked" and fails individually.
struct UserDirectory {
    latency:   Duration,
    fetches:   AtomicUsize,
    keys_seen: AtomicUsize,
}

#[async_trait::async_trait]
impl Fetcher for UserDirectory {
    type Error = Missing;
    type Key = u32;
    type Value = String;

    #[instrument(level = "trace", skip(self))]
    async fn fetch_many(&self, keys: &[u32]) -> FetchOutcome<String, Missing> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.keys_seen.fetch_add(keys.len(), Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;

        let values = keys.iter().map(|id| Some(format!("user-{id}"))).collect();
        let errors = keys
            .iter()
            .map(|id| (id % 97 == 0).then_some(Missing(*id)))
            .collect();
        FetchOutcome::with_errors(values, errors)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let directory = Arc::new(UserDirectory {
        latency:   Duration::from_millis(cli.latency_ms),
        fetches:   AtomicUsize::new(0),
        keys_seen: AtomicUsize::new(0),
    });

    let loader = BatchLoader::<UserDirectory>::builder()
        .fetcher(Arc::clone(&directory))
        .name("users")
        .wait(Duration::from_millis(cli.wait_ms))
        .max_batch(cli.max_batch)
        .build()?;

    let failures = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let workers = (0..cli.workers)
        .map(|_| {
            let loader = Arc::clone(&loader);
            let failures = Arc::clone(&failures);
            let (lookups, users) = (cli.lookups, cli.users);
            tokio::spawn(async move {
                for _ in 0..lookups {
                    let ids = (0..4).map(|_| rand::random_range(0..users)).collect::<Vec<_>>();
                    for result in loader.load_many(ids).await {
                        if result.is_err() {
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for worker in workers {
        worker.await?;
    }

    let requested = cli.workers * cli.lookups * 4;
    let fetches = directory.fetches.load(Ordering::Relaxed);
    let keys_seen = directory.keys_seen.load(Ordering::Relaxed);

    info!("{requested} lookups in {:.2?}", started.elapsed());
    info!(
        "{fetches} fetch(es), {keys_seen} key(s) fetched, {:.1} key(s) per fetch",
        keys_seen as f64 / fetches.max(1) as f64
    );
    info!(
        "{} cached entries, {} failed lookups",
        loader.cache_size(),
        failures.load(Ordering::Relaxed)
    );

    Ok(())
}
