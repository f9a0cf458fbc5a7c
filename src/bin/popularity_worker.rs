//! Batch worker: product/merchant popularity aggregation.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use feedcore::cache::RedisFeatureCache;
use feedcore::config::{init_tracing, Config};
use feedcore::popularity::{aggregate_merchants, aggregate_products};
use feedcore::store::SqliteProductStore;

#[derive(Parser, Debug)]
struct Args {
    /// Run a single aggregation pass and exit, instead of looping.
    #[arg(long)]
    once: bool,

    /// Seconds between aggregation passes when not run with --once.
    #[arg(long, default_value_t = 3600, env = "POPULARITY_INTERVAL_SECS")]
    interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env();
    let args = Args::parse();

    let cache = Arc::new(RedisFeatureCache::connect(&config.redis_url).await?);
    let store = Arc::new(SqliteProductStore::open(&config.database_path)?);

    if args.once {
        run_pass(store.as_ref(), cache.as_ref()).await?;
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs));
    loop {
        ticker.tick().await;
        if let Err(e) = run_pass(store.as_ref(), cache.as_ref()).await {
            tracing::error!(error = %e, "popularity aggregation pass failed");
        }
    }
}

async fn run_pass(
    store: &SqliteProductStore,
    cache: &RedisFeatureCache,
) -> anyhow::Result<()> {
    let products = aggregate_products(store, cache).await?;
    let merchants = aggregate_merchants(store).await?;
    tracing::info!(products, merchants, "popularity aggregation pass complete");
    Ok(())
}
