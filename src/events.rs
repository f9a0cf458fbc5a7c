//! Event consumer: drains the inbound interaction queue.

use std::sync::Arc;

use chrono::Utc;

use crate::bandit::Bandit;
use crate::cache::FeatureCache;
use crate::error::{retry_once, CoreError};
use crate::models::{EventPayload, Interaction, InteractionType};
use crate::store::ProductStore;

/// Ingest-side producer: left-push an event onto the `events` queue.
/// At-least-once delivery; the caller (the out-of-scope HTTP layer) is
/// responsible for acking the client once this returns `Ok`.
pub async fn ingest_event<C: FeatureCache + ?Sized>(
    cache: &C,
    event: &EventPayload,
) -> crate::error::Result<()> {
    if event.session_id.is_empty() || event.product_id.is_empty() {
        return Err(CoreError::InvalidInput(
            "sessionId and productId are required".into(),
        ));
    }
    let payload = serde_json::to_string(event)?;
    cache.queue_push_raw(&payload).await
}

/// Drains the `events` queue, applying the per-event update steps.
/// Safe to run as multiple concurrent instances against the same queue.
pub struct EventConsumer<C: FeatureCache, S: ProductStore> {
    cache: Arc<C>,
    store: Arc<S>,
}

impl<C: FeatureCache, S: ProductStore> EventConsumer<C, S> {
    pub fn new(cache: Arc<C>, store: Arc<S>) -> Self {
        Self { cache, store }
    }

    /// Run until `shutdown` resolves. Cancellation is a clean stop after
    /// the in-flight event, not a hard abort.
    pub async fn run(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        loop {
            if shutdown.try_recv().is_ok() {
                tracing::info!("event consumer stopping on shutdown signal");
                return;
            }
            match self.cache.queue_pop(crate::constants::QUEUE_POP_TIMEOUT).await {
                Ok(Some(raw)) => self.process_raw(&raw).await,
                Ok(None) => tokio::time::sleep(crate::constants::QUEUE_IDLE_YIELD).await,
                Err(e) => {
                    tracing::warn!(error = %e, "event queue pop failed, backing off");
                    tokio::time::sleep(crate::constants::QUEUE_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Process a single raw queue payload. Exposed directly for tests so
    /// scenarios don't need a real queue round-trip.
    pub async fn process_raw(&self, raw: &str) {
        let event: EventPayload = match serde_json::from_str(raw) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, raw, "discarding malformed event");
                return;
            }
        };
        self.process(&event).await;
    }

    pub async fn process(&self, event: &EventPayload) {
        // Step 1: session trail, retried once on transient cache failure.
        let result = retry_once(|| async {
            self.cache
                .session_push(&event.session_id, &event.product_id)
                .await
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, session_id = %event.session_id, "session trail update failed");
        }

        // Step 2: bandit outcome, derived from product meta lookup.
        match self.store.get_product(&event.product_id).await {
            Ok(Some(product)) => {
                let bandit = Bandit::new(self.cache.as_ref());
                if let Some(success) = bandit_outcome(event.event_type) {
                    bandit
                        .record(
                            crate::models::BanditKind::Merchant,
                            &product.merchant_id,
                            success,
                        )
                        .await;
                    bandit
                        .record(
                            crate::models::BanditKind::Category,
                            &product.category_id,
                            success,
                        )
                        .await;
                }
            }
            Ok(None) => {
                tracing::warn!(product_id = %event.product_id, "product meta not found, skipping bandit update");
            }
            Err(e) => {
                tracing::warn!(error = %e, product_id = %event.product_id, "store lookup failed, skipping bandit update");
            }
        }

        // Step 3: append interaction row with weight 1.
        let interaction = Interaction {
            id: None,
            user_id: event.user_id.clone(),
            session_id: event.session_id.clone(),
            product_id: event.product_id.clone(),
            interaction_type: event.event_type,
            value: 1.0,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_interaction(&interaction).await {
            tracing::warn!(error = %e, "failed to append interaction row");
        }
    }
}

/// CLICK/PURCHASE are bandit successes, VIEW is a failure, CART is neutral
/// (no update).
fn bandit_outcome(kind: InteractionType) -> Option<bool> {
    match kind {
        InteractionType::Click | InteractionType::Purchase => Some(true),
        InteractionType::View => Some(false),
        InteractionType::Cart => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryFeatureCache;
    use crate::models::{BanditKind, Product};
    use crate::store::SqliteProductStore;
    use tempfile::NamedTempFile;

    fn store_with_product() -> (SqliteProductStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteProductStore::open(file.path().to_str().unwrap()).unwrap();
        store
            .upsert_product(&Product {
                id: "p1".into(),
                title: "Red Shoe".into(),
                description: String::new(),
                merchant_id: "m1".into(),
                category_id: "c1".into(),
                popularity: 1.0,
            })
            .unwrap();
        (store, file)
    }

    #[tokio::test]
    async fn click_records_bandit_success_and_appends_interaction() {
        let cache = Arc::new(MemoryFeatureCache::new());
        let (store, _f) = store_with_product();
        let store = Arc::new(store);
        let consumer = EventConsumer::new(cache.clone(), store.clone());

        consumer
            .process(&EventPayload {
                user_id: Some("u1".into()),
                session_id: "s1".into(),
                product_id: "p1".into(),
                event_type: InteractionType::Click,
            })
            .await;

        let posterior = cache.bandit_get(BanditKind::Merchant, "m1").await.unwrap();
        assert_eq!((posterior.alpha, posterior.beta), (2, 1));

        let recent = cache.session_recent("s1", 10).await.unwrap();
        assert_eq!(recent, vec!["p1".to_string()]);

        let since = Utc::now() - chrono::Duration::days(1);
        let rows = store.interactions_since(since, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 1.0);
    }

    #[tokio::test]
    async fn cart_event_does_not_touch_the_bandit() {
        let cache = Arc::new(MemoryFeatureCache::new());
        let (store, _f) = store_with_product();
        let consumer = EventConsumer::new(cache.clone(), Arc::new(store));

        consumer
            .process(&EventPayload {
                user_id: None,
                session_id: "s1".into(),
                product_id: "p1".into(),
                event_type: InteractionType::Cart,
            })
            .await;

        let posterior = cache.bandit_get(BanditKind::Merchant, "m1").await.unwrap();
        assert_eq!((posterior.alpha, posterior.beta), (1, 1));
    }

    #[tokio::test]
    async fn malformed_json_is_discarded_without_panicking() {
        let cache = Arc::new(MemoryFeatureCache::new());
        let (store, _f) = store_with_product();
        let consumer = EventConsumer::new(cache, Arc::new(store));
        consumer.process_raw("{ not json").await;
    }

    #[tokio::test]
    async fn ingest_event_rejects_missing_identifiers() {
        let cache = MemoryFeatureCache::new();
        let err = ingest_event(
            &cache,
            &EventPayload {
                user_id: None,
                session_id: String::new(),
                product_id: "p1".into(),
                event_type: InteractionType::View,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }
}
