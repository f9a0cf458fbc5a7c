//! Collaborative-filtering batch trainer.
//!
//! Implicit-feedback matrix factorization trained with plain SGD, working
//! probability/score math directly in `f64` rather than reaching for a
//! linear-algebra crate: there's no shared dimension here big enough to
//! need `nalgebra`, just per-user/per-product vectors updated in place.

use std::collections::HashMap;

use chrono::{Duration as ChronoDuration, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::cache::FeatureCache;
use crate::constants::{
    interaction_weight, CF_EPOCHS, CF_INIT_NOISE, CF_INTERACTION_ROW_CAP,
    CF_INTERACTION_WINDOW_DAYS, CF_L2_REG, CF_LEARNING_RATE, TOPK_CAP,
};
use crate::error::Result;
use crate::store::ProductStore;

pub const USER_FACTORS_NAMESPACE: &str = "user_factors";
pub const PRODUCT_FACTORS_NAMESPACE: &str = "product_factors";

/// One (user, product) implicit-feedback observation, summed across the
/// interaction window by `interaction_weight(type)` (never
/// the raw stored `Interaction.value`, which is always 1).
#[derive(Debug, Clone, PartialEq)]
struct Observation {
    user_id: String,
    product_id: String,
    weight: f64,
}

/// Deterministic given the same store contents and `seed`: grouping keys
/// are sorted before SGD runs, so iteration order never depends on a
/// `HashMap`'s hash seed.
pub async fn train<S: ProductStore, C: FeatureCache>(
    store: &S,
    cache: &C,
    seed: u64,
    latent_dim: usize,
) -> Result<CfTrainingSummary> {
    let since = Utc::now() - ChronoDuration::days(CF_INTERACTION_WINDOW_DAYS);
    let interactions = store.interactions_since(since, CF_INTERACTION_ROW_CAP).await?;

    let mut grouped: HashMap<(String, String), f64> = HashMap::new();
    for interaction in &interactions {
        let Some(user_id) = interaction.user_id.clone() else {
            continue;
        };
        let entry = grouped
            .entry((user_id, interaction.product_id.clone()))
            .or_insert(0.0);
        *entry += interaction_weight(interaction.interaction_type);
    }

    let mut observations: Vec<Observation> = grouped
        .into_iter()
        .map(|((user_id, product_id), weight)| Observation { user_id, product_id, weight })
        .collect();
    // Canonical order for reproducibility: the HashMap above scrambles
    // iteration order across runs, so every epoch replays the same
    // (user, product) sequence regardless of process.
    observations.sort_by(|a, b| (&a.user_id, &a.product_id).cmp(&(&b.user_id, &b.product_id)));

    if observations.is_empty() {
        return Ok(CfTrainingSummary { users_trained: 0, products_trained: 0, users_scored: 0 });
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut user_ids: Vec<String> = observations.iter().map(|o| o.user_id.clone()).collect();
    user_ids.sort();
    user_ids.dedup();
    let mut product_ids: Vec<String> = observations.iter().map(|o| o.product_id.clone()).collect();
    product_ids.sort();
    product_ids.dedup();

    let mut user_vectors: HashMap<String, Vec<f64>> = user_ids
        .iter()
        .map(|id| (id.clone(), init_vector(latent_dim, &mut rng)))
        .collect();
    let mut product_vectors: HashMap<String, Vec<f64>> = product_ids
        .iter()
        .map(|id| (id.clone(), init_vector(latent_dim, &mut rng)))
        .collect();

    for _epoch in 0..CF_EPOCHS {
        for obs in &observations {
            sgd_step(&mut user_vectors, &mut product_vectors, obs, latent_dim);
        }
    }

    for (user_id, vector) in &user_vectors {
        store.save_factors(USER_FACTORS_NAMESPACE, user_id, vector).await?;
    }
    for (product_id, vector) in &product_vectors {
        store.save_factors(PRODUCT_FACTORS_NAMESPACE, product_id, vector).await?;
    }

    let product_entries: Vec<(&String, &Vec<f64>)> = product_vectors.iter().collect();
    let user_topk: Vec<(String, Vec<(String, f64)>)> = user_ids
        .par_iter()
        .map(|user_id| {
            let u = &user_vectors[user_id];
            let mut scored: Vec<(String, f64)> = product_entries
                .iter()
                .map(|(product_id, p)| (product_id.to_string(), dot(u, p)))
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(TOPK_CAP);
            (user_id.clone(), scored)
        })
        .collect();

    for (user_id, topk) in &user_topk {
        cache
            .user_topk_replace(user_id, topk, crate::constants::CACHE_TTL)
            .await?;
    }

    Ok(CfTrainingSummary {
        users_trained: user_vectors.len(),
        products_trained: product_vectors.len(),
        users_scored: user_topk.len(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfTrainingSummary {
    pub users_trained: usize,
    pub products_trained: usize,
    pub users_scored: usize,
}

fn init_vector(dim: usize, rng: &mut impl Rng) -> Vec<f64> {
    (0..dim).map(|_| rng.gen_range(-CF_INIT_NOISE..CF_INIT_NOISE)).collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// One implicit-feedback SGD update:
/// `e = weight - u·p`, `u += lr * (e*p - l2*u)`, `p += lr * (e*u - l2*p)`.
fn sgd_step(
    user_vectors: &mut HashMap<String, Vec<f64>>,
    product_vectors: &mut HashMap<String, Vec<f64>>,
    obs: &Observation,
    dim: usize,
) {
    let u = user_vectors.get(&obs.user_id).expect("seeded above").clone();
    let p = product_vectors.get(&obs.product_id).expect("seeded above").clone();
    let error = obs.weight - dot(&u, &p);

    let new_u: Vec<f64> = (0..dim)
        .map(|k| u[k] + CF_LEARNING_RATE * (error * p[k] - CF_L2_REG * u[k]))
        .collect();
    let new_p: Vec<f64> = (0..dim)
        .map(|k| p[k] + CF_LEARNING_RATE * (error * u[k] - CF_L2_REG * p[k]))
        .collect();

    user_vectors.insert(obs.user_id.clone(), new_u);
    product_vectors.insert(obs.product_id.clone(), new_p);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryFeatureCache;
    use crate::models::{Interaction, InteractionType, Product};
    use crate::store::SqliteProductStore;
    use tempfile::NamedTempFile;

    fn setup() -> (SqliteProductStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteProductStore::open(file.path().to_str().unwrap()).unwrap();
        for id in ["p1", "p2", "p3"] {
            store
                .upsert_product(&Product {
                    id: id.into(),
                    title: id.into(),
                    description: String::new(),
                    merchant_id: "m1".into(),
                    category_id: "c1".into(),
                    popularity: 0.0,
                })
                .unwrap();
        }
        (store, file)
    }

    async fn log(store: &SqliteProductStore, user: &str, product: &str, kind: InteractionType) {
        store
            .append_interaction(&Interaction {
                id: None,
                user_id: Some(user.into()),
                session_id: "s1".into(),
                product_id: product.into(),
                interaction_type: kind,
                value: 1.0,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn training_converges_toward_higher_scores_for_purchased_products() {
        let (store, _f) = setup();
        log(&store, "u1", "p1", InteractionType::Purchase).await;
        log(&store, "u1", "p2", InteractionType::View).await;
        log(&store, "u2", "p3", InteractionType::Purchase).await;

        let cache = MemoryFeatureCache::new();
        let summary = train(&store, &cache, 7, 8).await.unwrap();
        assert_eq!(summary.users_trained, 2);
        assert_eq!(summary.products_trained, 3);

        let topk = cache.user_topk_get("u1").await.unwrap();
        assert!(!topk.is_empty());
        let p1_score = topk.iter().find(|(id, _)| id == "p1").unwrap().1;
        let p2_score = topk.iter().find(|(id, _)| id == "p2").unwrap().1;
        assert!(p1_score > p2_score, "purchase should outrank a view after training");
    }

    #[tokio::test]
    async fn same_seed_yields_identical_factors_across_independent_runs() {
        let (store_a, _fa) = setup();
        let (store_b, _fb) = setup();
        for (store, _) in [(&store_a, &_fa), (&store_b, &_fb)] {
            log(store, "u1", "p1", InteractionType::Click).await;
            log(store, "u1", "p2", InteractionType::Purchase).await;
        }

        let cache_a = MemoryFeatureCache::new();
        let cache_b = MemoryFeatureCache::new();
        train(&store_a, &cache_a, 42, 4).await.unwrap();
        train(&store_b, &cache_b, 42, 4).await.unwrap();

        let factors_a = store_a.load_all_factors(USER_FACTORS_NAMESPACE).await.unwrap();
        let factors_b = store_b.load_all_factors(USER_FACTORS_NAMESPACE).await.unwrap();
        assert_eq!(factors_a.get("u1"), factors_b.get("u1"));
    }

    #[tokio::test]
    async fn anonymous_interactions_without_a_user_id_are_skipped() {
        let (store, _f) = setup();
        store
            .append_interaction(&Interaction {
                id: None,
                user_id: None,
                session_id: "s1".into(),
                product_id: "p1".into(),
                interaction_type: InteractionType::View,
                value: 1.0,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let cache = MemoryFeatureCache::new();
        let summary = train(&store, &cache, 1, 4).await.unwrap();
        assert_eq!(summary.users_trained, 0);
    }
}
