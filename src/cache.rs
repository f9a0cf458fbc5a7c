//! Feature cache contract: the fast-path store backing the ranker.
//!
//! A typed façade over the fast KV store. `RedisFeatureCache` realizes the
//! key schema literally; `MemoryFeatureCache` is an in-process test double
//! with the same atomicity guarantees, used so the rest of the core can be
//! exercised without a running Redis.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;

use crate::error::{CoreError, Result};
use crate::models::{BanditKind, BetaPosterior, ProductMeta};

const EVENTS_QUEUE_KEY: &str = "events";
const PRODUCT_META_KEY: &str = "product:meta";
const GLOBAL_TOPK_KEY: &str = "global:topk";

pub fn user_topk_key(user_id: &str) -> String {
    format!("user:topk:{user_id}")
}

fn session_key(session_id: &str) -> String {
    format!("session:{session_id}:recent")
}

/// Typed façade over the fast store. A reader of a replaced top-K
/// sorted set sees either the old or the new set, never a partial one.
#[async_trait]
pub trait FeatureCache: Send + Sync {
    async fn topk_replace(&self, key: &str, items: &[(String, f64)], ttl: Duration)
        -> Result<()>;
    async fn topk_get(&self, key: &str) -> Result<Vec<(String, f64)>>;

    async fn global_topk_replace(&self, items: &[(String, f64)]) -> Result<()> {
        self.topk_replace(GLOBAL_TOPK_KEY, items, Duration::MAX).await
    }
    async fn global_topk_get(&self) -> Result<Vec<(String, f64)>> {
        self.topk_get(GLOBAL_TOPK_KEY).await
    }
    async fn user_topk_replace(
        &self,
        user_id: &str,
        items: &[(String, f64)],
        ttl: Duration,
    ) -> Result<()> {
        self.topk_replace(&user_topk_key(user_id), items, ttl).await
    }
    async fn user_topk_get(&self, user_id: &str) -> Result<Vec<(String, f64)>> {
        self.topk_get(&user_topk_key(user_id)).await
    }

    async fn meta_set_many(&self, metas: &[(String, ProductMeta)]) -> Result<()>;
    async fn meta_get_many(&self, ids: &[String]) -> Result<HashMap<String, ProductMeta>>;

    async fn bandit_get(&self, kind: BanditKind, id: &str) -> Result<BetaPosterior>;
    async fn bandit_record(&self, kind: BanditKind, id: &str, success: bool) -> Result<()>;

    /// Left-push `product_id`, trim to 50, refresh TTL. A push that would
    /// duplicate the current head is a no-op (besides the TTL refresh).
    async fn session_push(&self, session_id: &str, product_id: &str) -> Result<()>;
    async fn session_recent(&self, session_id: &str, limit: usize) -> Result<Vec<String>>;

    async fn queue_push_raw(&self, payload_json: &str) -> Result<()>;
    /// Blocking right-pop with a timeout; `None` on an empty queue.
    async fn queue_pop(&self, timeout: Duration) -> Result<Option<String>>;
}

// ---------------------------------------------------------------------
// Redis-backed implementation
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct RedisFeatureCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisFeatureCache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CoreError::CacheUnavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| CoreError::CacheUnavailable(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl FeatureCache for RedisFeatureCache {
    async fn topk_replace(
        &self,
        key: &str,
        items: &[(String, f64)],
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().del(key);
        if !items.is_empty() {
            let members: Vec<(f64, &str)> =
                items.iter().map(|(id, score)| (*score, id.as_str())).collect();
            pipe.zadd_multiple(key, &members);
        }
        if ttl != Duration::MAX {
            pipe.expire(key, ttl.as_secs() as i64);
        }
        pipe.query_async(&mut conn).await.map_err(CoreError::from)
    }

    async fn topk_get(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        let raw: Vec<(String, f64)> = conn.zrevrange_withscores(key, 0, -1).await?;
        Ok(raw)
    }

    async fn meta_set_many(&self, metas: &[(String, ProductMeta)]) -> Result<()> {
        if metas.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let encoded: Result<Vec<(String, String)>> = metas
            .iter()
            .map(|(id, meta)| Ok((id.clone(), serde_json::to_string(meta)?)))
            .collect();
        let encoded = encoded?;
        let _: () = conn.hset_multiple(PRODUCT_META_KEY, &encoded).await?;
        Ok(())
    }

    async fn meta_get_many(&self, ids: &[String]) -> Result<HashMap<String, ProductMeta>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = conn.hget(PRODUCT_META_KEY, ids).await?;
        let mut out = HashMap::new();
        for (id, value) in ids.iter().zip(raw.into_iter()) {
            if let Some(json) = value {
                if let Ok(meta) = serde_json::from_str::<ProductMeta>(&json) {
                    out.insert(id.clone(), meta);
                }
            }
        }
        Ok(out)
    }

    async fn bandit_get(&self, kind: BanditKind, id: &str) -> Result<BetaPosterior> {
        let mut conn = self.conn.clone();
        let key = kind.cache_key(id);
        let raw: Vec<Option<String>> = conn.hget(&key, &["a", "b"]).await?;
        let alpha = raw[0].as_deref().and_then(|s| s.parse().ok()).unwrap_or(1);
        let beta = raw[1].as_deref().and_then(|s| s.parse().ok()).unwrap_or(1);
        Ok(BetaPosterior { alpha, beta })
    }

    async fn bandit_record(&self, kind: BanditKind, id: &str, success: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = kind.cache_key(id);
        let field = if success { "a" } else { "b" };
        // Seed both fields to the (1,1) default before incrementing, so a
        // key touched for the first time starts from the documented prior
        // rather than from HINCRBY's implicit zero.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSETNX")
            .arg(&key)
            .arg("a")
            .arg(1)
            .ignore()
            .cmd("HSETNX")
            .arg(&key)
            .arg("b")
            .arg(1)
            .ignore()
            .hincr(&key, field, 1_i64)
            .ignore();
        pipe.query_async(&mut conn).await.map_err(CoreError::from)
    }

    async fn session_push(&self, session_id: &str, product_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = session_key(session_id);
        let head: Option<String> = conn.lindex(&key, 0).await?;
        if head.as_deref() != Some(product_id) {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lpush(&key, product_id)
                .ltrim(&key, 0, crate::constants::SESSION_TRAIL_CAP as isize - 1);
            pipe.query_async(&mut conn).await.map_err(CoreError::from)?;
        }
        let _: () = conn
            .expire(&key, crate::constants::CACHE_TTL.as_secs() as i64)
            .await?;
        Ok(())
    }

    async fn session_recent(&self, session_id: &str, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let key = session_key(session_id);
        let items: Vec<String> = conn.lrange(&key, 0, limit as isize - 1).await?;
        Ok(items)
    }

    async fn queue_push_raw(&self, payload_json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(EVENTS_QUEUE_KEY, payload_json).await?;
        Ok(())
    }

    async fn queue_pop(&self, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let result: Option<(String, String)> =
            conn.brpop(EVENTS_QUEUE_KEY, timeout.as_secs_f64()).await?;
        Ok(result.map(|(_, payload)| payload))
    }
}

// ---------------------------------------------------------------------
// In-memory test double
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    sorted_sets: HashMap<String, Vec<(String, f64)>>,
    meta: HashMap<String, String>,
    bandit: HashMap<String, (u32, u32)>,
    sessions: HashMap<String, VecDeque<String>>,
    queue: VecDeque<String>,
}

/// In-process stand-in for the Redis-backed cache, with the same
/// atomicity and key-schema contract. Used by tests and by `cfg(test)`
/// scenario harnesses.
#[derive(Clone, Default)]
pub struct MemoryFeatureCache {
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<tokio::sync::Notify>,
}

impl MemoryFeatureCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeatureCache for MemoryFeatureCache {
    async fn topk_replace(
        &self,
        key: &str,
        items: &[(String, f64)],
        _ttl: Duration,
    ) -> Result<()> {
        let mut sorted = items.to_vec();
        sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        self.state.lock().sorted_sets.insert(key.to_string(), sorted);
        Ok(())
    }

    async fn topk_get(&self, key: &str) -> Result<Vec<(String, f64)>> {
        Ok(self.state.lock().sorted_sets.get(key).cloned().unwrap_or_default())
    }

    async fn meta_set_many(&self, metas: &[(String, ProductMeta)]) -> Result<()> {
        let mut state = self.state.lock();
        for (id, meta) in metas {
            let json = serde_json::to_string(meta)?;
            state.meta.insert(id.clone(), json);
        }
        Ok(())
    }

    async fn meta_get_many(&self, ids: &[String]) -> Result<HashMap<String, ProductMeta>> {
        let state = self.state.lock();
        let mut out = HashMap::new();
        for id in ids {
            if let Some(json) = state.meta.get(id) {
                if let Ok(meta) = serde_json::from_str::<ProductMeta>(json) {
                    out.insert(id.clone(), meta);
                }
            }
        }
        Ok(out)
    }

    async fn bandit_get(&self, kind: BanditKind, id: &str) -> Result<BetaPosterior> {
        let key = kind.cache_key(id);
        let (alpha, beta) = self.state.lock().bandit.get(&key).copied().unwrap_or((1, 1));
        Ok(BetaPosterior { alpha, beta })
    }

    async fn bandit_record(&self, kind: BanditKind, id: &str, success: bool) -> Result<()> {
        let key = kind.cache_key(id);
        let mut state = self.state.lock();
        let entry = state.bandit.entry(key).or_insert((1, 1));
        if success {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
        Ok(())
    }

    async fn session_push(&self, session_id: &str, product_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let trail = state.sessions.entry(session_id.to_string()).or_default();
        if trail.front().map(String::as_str) != Some(product_id) {
            trail.push_front(product_id.to_string());
            trail.truncate(crate::constants::SESSION_TRAIL_CAP);
        }
        Ok(())
    }

    async fn session_recent(&self, session_id: &str, limit: usize) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .sessions
            .get(session_id)
            .map(|t| t.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn queue_push_raw(&self, payload_json: &str) -> Result<()> {
        self.state.lock().queue.push_front(payload_json.to_string());
        self.notify.notify_one();
        Ok(())
    }

    async fn queue_pop(&self, timeout: Duration) -> Result<Option<String>> {
        loop {
            if let Some(item) = self.state.lock().queue.pop_back() {
                return Ok(Some(item));
            }
            if tokio::time::timeout(timeout, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BanditKind;

    #[tokio::test]
    async fn topk_replace_is_observable_as_a_single_committed_set() {
        let cache = MemoryFeatureCache::new();
        cache
            .user_topk_replace("u1", &[("p1".into(), 3.0), ("p2".into(), 9.0)], Duration::MAX)
            .await
            .unwrap();
        let got = cache.user_topk_get("u1").await.unwrap();
        assert_eq!(got, vec![("p2".to_string(), 9.0), ("p1".to_string(), 3.0)]);
    }

    #[tokio::test]
    async fn bandit_round_trip_after_k_successes_and_m_failures() {
        let cache = MemoryFeatureCache::new();
        for _ in 0..3 {
            cache.bandit_record(BanditKind::Merchant, "m1", true).await.unwrap();
        }
        for _ in 0..2 {
            cache.bandit_record(BanditKind::Merchant, "m1", false).await.unwrap();
        }
        let posterior = cache.bandit_get(BanditKind::Merchant, "m1").await.unwrap();
        assert_eq!((posterior.alpha, posterior.beta), (4, 3));
    }

    #[tokio::test]
    async fn session_trail_caps_at_fifty_newest_at_head() {
        let cache = MemoryFeatureCache::new();
        for i in 0..60 {
            cache.session_push("s1", &format!("p{i}")).await.unwrap();
        }
        let trail = cache.session_recent("s1", 100).await.unwrap();
        assert_eq!(trail.len(), 50);
        assert_eq!(trail[0], "p59");
    }

    #[tokio::test]
    async fn session_trail_does_not_duplicate_consecutive_push() {
        let cache = MemoryFeatureCache::new();
        cache.session_push("s1", "p1").await.unwrap();
        cache.session_push("s1", "p1").await.unwrap();
        cache.session_push("s1", "p2").await.unwrap();
        let trail = cache.session_recent("s1", 100).await.unwrap();
        assert_eq!(trail, vec!["p2".to_string(), "p1".to_string()]);
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let cache = MemoryFeatureCache::new();
        cache.queue_push_raw("first").await.unwrap();
        cache.queue_push_raw("second").await.unwrap();
        assert_eq!(
            cache.queue_pop(Duration::from_millis(10)).await.unwrap(),
            Some("first".to_string())
        );
        assert_eq!(
            cache.queue_pop(Duration::from_millis(10)).await.unwrap(),
            Some("second".to_string())
        );
    }

    #[tokio::test]
    async fn queue_pop_times_out_on_empty_queue() {
        let cache = MemoryFeatureCache::new();
        let result = cache.queue_pop(Duration::from_millis(20)).await.unwrap();
        assert_eq!(result, None);
    }
}
