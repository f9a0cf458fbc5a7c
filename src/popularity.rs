//! Popularity aggregation worker: product and merchant rollups.

use std::collections::HashMap;

use chrono::{Duration as ChronoDuration, Utc};

use crate::cache::FeatureCache;
use crate::constants::{
    interaction_weight, POPULARITY_MERCHANT_CAP, POPULARITY_PRODUCT_CAP, POPULARITY_WINDOW_DAYS,
};
use crate::error::Result;
use crate::models::ProductMeta;
use crate::store::ProductStore;

/// Sum `interaction_weight(type)` per product over the trailing window,
/// write the top [`POPULARITY_PRODUCT_CAP`] back onto `Product.popularity`,
/// and mirror the same set into the global top-K and product meta caches
/// so the ranker's popularity signal and backfill path see it immediately.
pub async fn aggregate_products<S: ProductStore, C: FeatureCache>(
    store: &S,
    cache: &C,
) -> Result<usize> {
    let since = Utc::now() - ChronoDuration::days(POPULARITY_WINDOW_DAYS);
    let interactions = store
        .interactions_since(since, crate::constants::CF_INTERACTION_ROW_CAP)
        .await?;

    let mut totals: HashMap<String, f64> = HashMap::new();
    for interaction in &interactions {
        *totals.entry(interaction.product_id.clone()).or_insert(0.0) +=
            interaction_weight(interaction.interaction_type);
    }

    let mut ranked: Vec<(String, f64)> = totals.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(POPULARITY_PRODUCT_CAP);

    let mut metas = Vec::with_capacity(ranked.len());
    for (product_id, popularity) in &ranked {
        store.set_product_popularity(product_id, *popularity).await?;
        if let Some(product) = store.get_product(product_id).await? {
            let mut meta: ProductMeta = (&product).into();
            meta.popularity = *popularity;
            metas.push((product_id.clone(), meta));
        }
    }
    cache.meta_set_many(&metas).await?;
    cache
        .global_topk_replace(&ranked)
        .await?;

    Ok(ranked.len())
}

/// Same aggregation, grouped by merchant instead of product, writing
/// `Merchant.popularity` for up to [`POPULARITY_MERCHANT_CAP`] merchants.
/// Kept as its own pass (rather than folded into `aggregate_products`)
/// since it needs every interacted product's `merchant_id`, not just the
/// top-capped slice.
pub async fn aggregate_merchants<S: ProductStore>(store: &S) -> Result<usize> {
    let since = Utc::now() - ChronoDuration::days(POPULARITY_WINDOW_DAYS);
    let interactions = store
        .interactions_since(since, crate::constants::CF_INTERACTION_ROW_CAP)
        .await?;

    let mut product_ids: Vec<String> = interactions.iter().map(|i| i.product_id.clone()).collect();
    product_ids.sort();
    product_ids.dedup();
    let products = store.get_products_by_ids(&product_ids).await?;
    let merchant_of: HashMap<&str, &str> =
        products.iter().map(|p| (p.id.as_str(), p.merchant_id.as_str())).collect();

    let mut totals: HashMap<String, f64> = HashMap::new();
    for interaction in &interactions {
        if let Some(merchant_id) = merchant_of.get(interaction.product_id.as_str()) {
            *totals.entry(merchant_id.to_string()).or_insert(0.0) +=
                interaction_weight(interaction.interaction_type);
        }
    }

    let mut ranked: Vec<(String, f64)> = totals.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(POPULARITY_MERCHANT_CAP);

    for (merchant_id, popularity) in &ranked {
        store.set_merchant_popularity(merchant_id, *popularity).await?;
    }
    Ok(ranked.len())
}
