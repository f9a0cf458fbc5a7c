//! Batch worker: collaborative-filtering model training.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use feedcore::cache::RedisFeatureCache;
use feedcore::cf::train;
use feedcore::config::{init_tracing, Config};
use feedcore::store::SqliteProductStore;

#[derive(Parser, Debug)]
struct Args {
    /// Run a single training pass and exit, instead of looping.
    #[arg(long)]
    once: bool,

    /// Seconds between training passes when not run with --once.
    #[arg(long, default_value_t = 21_600, env = "CF_INTERVAL_SECS")]
    interval_secs: u64,

    /// RNG seed for deterministic factor initialization and SGD ordering.
    #[arg(long, default_value_t = 42, env = "CF_SEED")]
    seed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env();
    let args = Args::parse();

    let cache = Arc::new(RedisFeatureCache::connect(&config.redis_url).await?);
    let store = Arc::new(SqliteProductStore::open(&config.database_path)?);

    if args.once {
        run_pass(store.as_ref(), cache.as_ref(), args.seed, config.latent_dim).await?;
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs));
    loop {
        ticker.tick().await;
        if let Err(e) = run_pass(store.as_ref(), cache.as_ref(), args.seed, config.latent_dim).await
        {
            tracing::error!(error = %e, "CF training pass failed");
        }
    }
}

async fn run_pass(
    store: &SqliteProductStore,
    cache: &RedisFeatureCache,
    seed: u64,
    latent_dim: usize,
) -> anyhow::Result<()> {
    let summary = train(store, cache, seed, latent_dim).await?;
    tracing::info!(
        users_trained = summary.users_trained,
        products_trained = summary.products_trained,
        users_scored = summary.users_scored,
        "CF training pass complete"
    );
    Ok(())
}
