//! Feed ranker: candidate generation, score fusion, diversity, pagination.

use std::collections::HashMap;
use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::bandit::Bandit;
use crate::cache::FeatureCache;
use crate::constants::{
    CALL_DEADLINE, CATEGORY_BACKFILL_LIMIT, MAX_CANDIDATES, SESSION_AFFINITY_WINDOW,
    TEXT_SEARCH_LIMIT, W_BANDIT, W_CF, W_POP, W_SESSION, W_TEXT_NO_QUERY, W_TEXT_WITH_QUERY,
};
use crate::diversity::{diversify, Diversifiable, DiversityPolicy};
use crate::error::{CoreError, Result};
use crate::models::{FeedItem, FeedRequest, FeedResponse, Product, ProductMeta};
use crate::store::ProductStore;

/// A candidate's base score plus whatever textual match produced it,
/// carried forward into fusion so the text score there doesn't need
/// recomputing against a second source.
#[derive(Debug, Clone, Copy, Default)]
struct Candidate {
    base: f64,
    text_score: f64,
}

/// A fully scored candidate, kept through the diversity pass before
/// being hydrated into a `FeedItem`.
struct Scored {
    product_id: String,
    meta: ProductMeta,
    score: f64,
}

impl Diversifiable for Scored {
    fn merchant_id(&self) -> &str {
        &self.meta.merchant_id
    }
    fn category_id(&self) -> &str {
        &self.meta.category_id
    }
}

pub struct FeedRanker<C: FeatureCache, S: ProductStore> {
    cache: Arc<C>,
    store: Arc<S>,
}

impl<C: FeatureCache, S: ProductStore> FeedRanker<C, S> {
    pub fn new(cache: Arc<C>, store: Arc<S>) -> Self {
        Self { cache, store }
    }

    /// Entry point: candidate generation, score fusion, diversity, and
    /// pagination. `request.limit` is the caller's already-clamped page
    /// size (clamping to `[MIN_LIMIT, MAX_LIMIT]` is a boundary concern,
    /// left to the HTTP surface).
    pub async fn get_feed(&self, request: &FeedRequest) -> Result<FeedResponse> {
        if request.limit == 0 {
            return Err(CoreError::InvalidInput("limit must be at least 1".into()));
        }

        let (order, candidates) = self.generate_candidates(request).await;
        let metas = self.hydrate_meta(&order).await;

        let session_recent: Vec<String> = match &request.session_id {
            Some(sid) => with_deadline(self.cache.session_recent(sid, SESSION_AFFINITY_WINDOW))
                .await
                .unwrap_or_default(),
            None => Vec::new(),
        };

        let mut rng = ChaCha8Rng::seed_from_u64(bandit_seed(request));
        let bandit = Bandit::new(self.cache.as_ref());
        let text_weight = if request.search_text.is_some() {
            W_TEXT_WITH_QUERY
        } else {
            W_TEXT_NO_QUERY
        };

        let mut scored = Vec::with_capacity(order.len());
        for product_id in &order {
            let Some(meta) = metas.get(product_id) else { continue };
            let candidate = candidates.get(product_id).copied().unwrap_or_default();

            let bandit_score = tokio::time::timeout(
                CALL_DEADLINE,
                bandit.sample(crate::models::BanditKind::Merchant, &meta.merchant_id, &mut rng),
            )
            .await
            .unwrap_or_else(|_| {
                tracing::warn!("bandit sample exceeded deadline, degrading to neutral 0.5");
                0.5
            });
            let session_score = if session_recent.contains(product_id) { 1.0 } else { 0.0 };

            let final_score = fuse_score(FusionInputs {
                base: candidate.base,
                popularity: meta.popularity,
                bandit: bandit_score,
                text_score: candidate.text_score,
                text_weight,
                session_score,
            });

            scored.push(Scored {
                product_id: product_id.clone(),
                meta: meta.clone(),
                score: final_score,
            });
        }

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let diversified = diversify(scored, DiversityPolicy::default());

        let start = request
            .cursor
            .as_ref()
            .and_then(|cursor| diversified.iter().position(|s| &s.product_id == cursor))
            .map(|idx| idx + 1)
            .unwrap_or(0);

        let page: Vec<&Scored> = diversified.iter().skip(start).take(request.limit).collect();
        let next_cursor = page.last().map(|s| s.product_id.clone());

        let product_ids: Vec<String> = page.iter().map(|s| s.product_id.clone()).collect();
        let products = with_deadline(self.store.get_products_by_ids(&product_ids))
            .await
            .unwrap_or_default();
        let product_by_id: HashMap<&str, &Product> =
            products.iter().map(|p| (p.id.as_str(), p)).collect();

        let items = page
            .into_iter()
            .filter_map(|s| {
                product_by_id.get(s.product_id.as_str()).map(|p| FeedItem {
                    score: s.score,
                    product: (*p).clone(),
                })
            })
            .collect();

        Ok(FeedResponse { items, cursor: next_cursor })
    }

    /// Candidate generation in the declared priority order — personalized,
    /// textual, popularity backfill, category backfill — accumulating a
    /// `baseScore` per id using each phase's own formula, truncated to
    /// `MAX_CANDIDATES` while preserving insertion order.
    async fn generate_candidates(
        &self,
        request: &FeedRequest,
    ) -> (Vec<String>, HashMap<String, Candidate>) {
        let mut order: Vec<String> = Vec::new();
        let mut candidates: HashMap<String, Candidate> = HashMap::new();

        // 1. Personalized: baseScore <- cfScore.
        if let Some(user_id) = &request.user_id {
            if let Ok(topk) = with_deadline(self.cache.user_topk_get(user_id)).await {
                for (id, cf_score) in topk {
                    if let std::collections::hash_map::Entry::Vacant(e) = candidates.entry(id.clone())
                    {
                        e.insert(Candidate { base: cf_score, text_score: 0.0 });
                        order.push(id);
                    }
                }
            }
        }

        // 2. Textual: baseScore <- max(existing, 0.05 + 0.8*textScore);
        // insert if absent.
        if let Some(query) = request.search_text.as_deref().filter(|q| !q.is_empty()) {
            if let Ok(hits) =
                with_deadline(self.store.search_products(query, TEXT_SEARCH_LIMIT)).await
            {
                for (product, text_score) in hits {
                    let computed_base = 0.05 + 0.8 * text_score;
                    match candidates.get_mut(&product.id) {
                        Some(existing) => {
                            existing.base = existing.base.max(computed_base);
                            existing.text_score = existing.text_score.max(text_score);
                        }
                        None => {
                            candidates.insert(
                                product.id.clone(),
                                Candidate { base: computed_base, text_score },
                            );
                            order.push(product.id);
                        }
                    }
                }
            }
        }

        // 3. Popularity backfill: insert absent ids with baseScore <-
        // 0.6*popularityScore, only while under 3*limit candidates.
        if candidates.len() < 3 * request.limit {
            let topk = with_deadline(self.cache.global_topk_get()).await.unwrap_or_default();
            if !topk.is_empty() {
                for (id, popularity_score) in topk {
                    if candidates.len() >= 3 * request.limit {
                        break;
                    }
                    if let std::collections::hash_map::Entry::Vacant(e) = candidates.entry(id.clone())
                    {
                        e.insert(Candidate { base: 0.6 * popularity_score, text_score: 0.0 });
                        order.push(id);
                    }
                }
            } else if let Ok(top) =
                with_deadline(self.store.top_products_by_popularity(MAX_CANDIDATES)).await
            {
                // Cache unavailable or not yet populated by the worker:
                // degrade by falling back to the store.
                for product in top {
                    if candidates.len() >= 3 * request.limit {
                        break;
                    }
                    if let std::collections::hash_map::Entry::Vacant(e) =
                        candidates.entry(product.id.clone())
                    {
                        e.insert(Candidate {
                            base: 0.6 * product.popularity,
                            text_score: 0.0,
                        });
                        order.push(product.id);
                    }
                }
            }
        }

        // 4. Category backfill: insert absent ids with baseScore <-
        // 0.5*popularity, only while under 2*limit candidates.
        if let Some(category_id) = &request.category_id {
            if candidates.len() < 2 * request.limit {
                if let Ok(top) = with_deadline(
                    self.store.top_products_by_category(category_id, CATEGORY_BACKFILL_LIMIT),
                )
                .await
                {
                    for product in top {
                        if candidates.len() >= 2 * request.limit {
                            break;
                        }
                        if let std::collections::hash_map::Entry::Vacant(e) =
                            candidates.entry(product.id.clone())
                        {
                            e.insert(Candidate {
                                base: 0.5 * product.popularity,
                                text_score: 0.0,
                            });
                            order.push(product.id);
                        }
                    }
                }
            }
        }

        order.truncate(MAX_CANDIDATES);
        (order, candidates)
    }

    /// Cache-first meta hydration; on a cache miss the store is consulted
    /// and the cache is fire-and-forget repopulated — never block the
    /// response on a cache write.
    async fn hydrate_meta(&self, ids: &[String]) -> HashMap<String, ProductMeta> {
        let mut metas = with_deadline(self.cache.meta_get_many(ids)).await.unwrap_or_default();
        let missing: Vec<String> =
            ids.iter().filter(|id| !metas.contains_key(*id)).cloned().collect();
        if missing.is_empty() {
            return metas;
        }
        if let Ok(products) = with_deadline(self.store.get_products_by_ids(&missing)).await {
            let fresh: Vec<(String, ProductMeta)> =
                products.iter().map(|p| (p.id.clone(), p.into())).collect();
            for (id, meta) in &fresh {
                metas.insert(id.clone(), meta.clone());
            }
            let cache = Arc::clone(&self.cache);
            tokio::spawn(async move {
                if let Err(e) = with_deadline(cache.meta_set_many(&fresh)).await {
                    tracing::warn!(error = %e, "fire-and-forget meta cache repopulation failed");
                }
            });
        }
        metas
    }
}

/// The five weighted terms of the score fusion formula, isolated from
/// their sources (cache reads, bandit sampling) so the arithmetic itself
/// is testable without a live `FeatureCache`.
#[derive(Debug, Clone, Copy)]
struct FusionInputs {
    base: f64,
    popularity: f64,
    bandit: f64,
    text_score: f64,
    text_weight: f64,
    session_score: f64,
}

fn fuse_score(inputs: FusionInputs) -> f64 {
    W_CF * inputs.base
        + W_POP * inputs.popularity
        + W_BANDIT * inputs.bandit
        + inputs.text_weight * inputs.text_score
        + W_SESSION * inputs.session_score
}

/// Wraps a single cache/store call with `CALL_DEADLINE`; on expiry, degrades
/// to a `DeadlineExceeded` error exactly like a live `CacheUnavailable`/
/// `StoreUnavailable` so existing callers' fallback paths apply unchanged.
async fn with_deadline<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(CALL_DEADLINE, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(deadline_ms = CALL_DEADLINE.as_millis(), "external call exceeded deadline");
            Err(CoreError::DeadlineExceeded(format!("{CALL_DEADLINE:?}")))
        }
    }
}

/// Bandit sampling still needs a source of randomness; seed it from the
/// request's session id (or "anon") so repeated calls within a session are
/// reproducible for a given cache state, without needing a shared RNG to
/// cross request boundaries.
fn bandit_seed(request: &FeedRequest) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    request.session_id.as_deref().unwrap_or("anon").hash(&mut hasher);
    request.user_id.as_deref().unwrap_or("").hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryFeatureCache;
    use crate::store::SqliteProductStore;
    use tempfile::NamedTempFile;

    fn setup() -> (SqliteProductStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteProductStore::open(file.path().to_str().unwrap()).unwrap();
        (store, file)
    }

    fn product(id: &str, title: &str, merchant: &str, category: &str, pop: f64) -> Product {
        Product {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            merchant_id: merchant.into(),
            category_id: category.into(),
            popularity: pop,
        }
    }

    /// S1: anonymous feed, no search, empty cache, store has P1/P2/P3 at
    /// popularity 10/5/1, all distinct merchants.
    #[tokio::test]
    async fn s1_anonymous_feed_backfills_from_popularity_store() {
        let (store, _f) = setup();
        store.upsert_product(&product("P1", "Widget", "m1", "c1", 10.0)).unwrap();
        store.upsert_product(&product("P2", "Gadget", "m2", "c2", 5.0)).unwrap();
        store.upsert_product(&product("P3", "Gizmo", "m3", "c3", 1.0)).unwrap();
        let cache = MemoryFeatureCache::new();

        let ranker = FeedRanker::new(Arc::new(cache), Arc::new(store));
        let response = ranker
            .get_feed(&FeedRequest { limit: 3, ..Default::default() })
            .await
            .unwrap();

        assert_eq!(response.items.len(), 3);
        let ids: Vec<_> = response.items.iter().map(|i| i.product.id.clone()).collect();
        assert_eq!(ids, vec!["P1", "P2", "P3"]);
        assert!(response.items.iter().all(|i| i.score > 0.0));
        assert_eq!(response.cursor, Some("P3".to_string()));
    }

    /// S2: text search ranks the exact-phrase match first even though it
    /// has no CF/popularity signal.
    #[tokio::test]
    async fn s2_text_search_ranks_best_match_first() {
        let (store, _f) = setup();
        store.upsert_product(&product("P1", "red shoe", "m1", "c1", 0.0)).unwrap();
        store.upsert_product(&product("P2", "blue shirt", "m2", "c2", 0.0)).unwrap();
        store.upsert_product(&product("P3", "red shirt", "m3", "c3", 0.0)).unwrap();
        let cache = MemoryFeatureCache::new();

        let ranker = FeedRanker::new(Arc::new(cache), Arc::new(store));
        let response = ranker
            .get_feed(&FeedRequest {
                search_text: Some("red shirt".into()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(response.items[0].product.id, "P3");
    }

    /// S3: 10 same-merchant candidates exercise the diversity relaxation
    /// path; output still contains every candidate exactly once.
    #[tokio::test]
    async fn s3_diversity_relaxes_when_one_merchant_dominates() {
        let (store, _f) = setup();
        let mut topk = Vec::new();
        for i in 0..10 {
            let id = format!("p{i}");
            store.upsert_product(&product(&id, &id, "M", "C", 1.0)).unwrap();
            topk.push((id, 1.0));
        }
        let cache = MemoryFeatureCache::new();
        cache.global_topk_replace(&topk).await.unwrap();

        let ranker = FeedRanker::new(Arc::new(cache), Arc::new(store));
        let response = ranker
            .get_feed(&FeedRequest { limit: 10, ..Default::default() })
            .await
            .unwrap();

        assert_eq!(response.items.len(), 10);
        let mut ids: Vec<_> = response.items.iter().map(|i| i.product.id.clone()).collect();
        ids.sort();
        let mut expected: Vec<_> = (0..10).map(|i| format!("p{i}")).collect();
        expected.sort();
        assert_eq!(ids, expected);
    }

    /// S4 at the formula level: with base/popularity/bandit/text held
    /// equal, being in the session trail adds exactly `wSess·1.0 = 0.10`
    /// (the scenario's own framing: "with all other inputs zero"). Tested
    /// against `fuse_score` directly rather than through `get_feed`, since
    /// the bandit term there is a live Thompson-sampling draw and would
    /// make a strict score-ordering assertion dependent on RNG luck.
    #[test]
    fn s4_session_trail_membership_adds_exactly_the_session_weight() {
        let shared = FusionInputs {
            base: 0.0,
            popularity: 0.0,
            bandit: 0.0,
            text_score: 0.0,
            text_weight: W_TEXT_NO_QUERY,
            session_score: 0.0,
        };
        let not_in_trail = fuse_score(FusionInputs { session_score: 0.0, ..shared });
        let in_trail = fuse_score(FusionInputs { session_score: 1.0, ..shared });
        assert!((in_trail - not_in_trail - W_SESSION).abs() < 1e-12);
    }

    /// End-to-end companion to S4: a product pushed onto the session trail
    /// is present in the response with a finite, non-negative score. Strict
    /// cross-product ordering isn't asserted here since the bandit term is
    /// a live random draw per product.
    #[tokio::test]
    async fn s4_session_trail_product_appears_in_the_feed_with_a_valid_score() {
        let (store, _f) = setup();
        store.upsert_product(&product("P7", "A", "m1", "c1", 1.0)).unwrap();
        store.upsert_product(&product("P4", "B", "m2", "c2", 1.0)).unwrap();
        let cache = MemoryFeatureCache::new();
        cache
            .global_topk_replace(&[("P7".into(), 1.0), ("P4".into(), 1.0)])
            .await
            .unwrap();
        cache.session_push("S", "P4").await.unwrap();
        cache.session_push("S", "P7").await.unwrap();

        let ranker = FeedRanker::new(Arc::new(cache), Arc::new(store));
        let response = ranker
            .get_feed(&FeedRequest {
                session_id: Some("S".into()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        let p7 = response.items.iter().find(|i| i.product.id == "P7").unwrap();
        assert!(p7.score.is_finite() && p7.score >= 0.0);
    }

    /// S6: pagination returns exactly `limit` items and a cursor pointing
    /// at the last one.
    #[tokio::test]
    async fn s6_pagination_returns_limit_items_and_trailing_cursor() {
        let (store, _f) = setup();
        let mut topk = Vec::new();
        for i in 0..10 {
            let id = format!("p{i}");
            store.upsert_product(&product(&id, &id, "m1", "c1", (10 - i) as f64)).unwrap();
            topk.push((id, (10 - i) as f64));
        }
        let cache = MemoryFeatureCache::new();
        cache.global_topk_replace(&topk).await.unwrap();

        let ranker = FeedRanker::new(Arc::new(cache), Arc::new(store));
        let response = ranker
            .get_feed(&FeedRequest { limit: 5, ..Default::default() })
            .await
            .unwrap();

        assert_eq!(response.items.len(), 5);
        assert_eq!(response.cursor, Some(response.items.last().unwrap().product.id.clone()));
    }

    #[tokio::test]
    async fn zero_limit_is_rejected() {
        let (store, _f) = setup();
        let cache = MemoryFeatureCache::new();
        let ranker = FeedRanker::new(Arc::new(cache), Arc::new(store));
        let err = ranker
            .get_feed(&FeedRequest { limit: 0, ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn empty_search_text_contributes_zero_text_score() {
        let (store, _f) = setup();
        store.upsert_product(&product("p1", "anything", "m1", "c1", 1.0)).unwrap();
        let cache = MemoryFeatureCache::new();
        cache.global_topk_replace(&[("p1".into(), 1.0)]).await.unwrap();

        let ranker = FeedRanker::new(Arc::new(cache), Arc::new(store));
        let with_empty_query = ranker
            .get_feed(&FeedRequest {
                search_text: Some(String::new()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        let without_query = ranker
            .get_feed(&FeedRequest { limit: 10, ..Default::default() })
            .await
            .unwrap();

        // Both runs use the same deterministic bandit seed (session_id is
        // None in both), so the only difference an empty query could make
        // is wText's weight; a zero textScore makes that moot too.
        assert_eq!(with_empty_query.items[0].score, without_query.items[0].score);
    }
}
