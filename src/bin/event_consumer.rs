//! Long-running worker: drains the `events` queue.

use std::sync::Arc;

use feedcore::cache::RedisFeatureCache;
use feedcore::config::{init_tracing, Config};
use feedcore::events::EventConsumer;
use feedcore::store::SqliteProductStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env();

    let cache = Arc::new(RedisFeatureCache::connect(&config.redis_url).await?);
    let store = Arc::new(SqliteProductStore::open(&config.database_path)?);
    let consumer = EventConsumer::new(cache, store);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    tracing::info!("feedcore-event-consumer starting");
    consumer.run(shutdown_rx).await;
    tracing::info!("feedcore-event-consumer stopped");

    Ok(())
}
