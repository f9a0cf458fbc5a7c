//! Tunables shared across the ranking pipeline and the batch workers.
//!
//! Centralized so a reviewer can check a weight or a TTL in one place
//! instead of hunting through `ranker.rs`/`cf.rs`/`cache.rs`.

use std::time::Duration;

/// Latent factor dimension default (`LATENT_DIM`).
pub const DEFAULT_LATENT_DIM: usize = 32;

/// Per-user / global top-K cap.
pub const TOPK_CAP: usize = 200;

/// TTL applied to user top-K, global top-K, and session trails.
pub const CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Session trail max length.
pub const SESSION_TRAIL_CAP: usize = 50;

/// Session trail window consulted for the `sessionAffinity` ranking signal.
pub const SESSION_AFFINITY_WINDOW: usize = 20;

/// Candidate set truncation before scoring.
pub const MAX_CANDIDATES: usize = 200;

/// Textual candidate fan-in limit.
pub const TEXT_SEARCH_LIMIT: usize = 200;

/// Category backfill fan-in limit.
pub const CATEGORY_BACKFILL_LIMIT: usize = 200;

/// Default/min/max page size.
pub const DEFAULT_LIMIT: usize = 30;
pub const MIN_LIMIT: usize = 1;
pub const MAX_LIMIT: usize = 100;

/// Score fusion weights.
pub const W_CF: f64 = 0.45;
pub const W_POP: f64 = 0.18;
pub const W_BANDIT: f64 = 0.12;
pub const W_SESSION: f64 = 0.10;
pub const W_TEXT_WITH_QUERY: f64 = 0.20;
pub const W_TEXT_NO_QUERY: f64 = 0.05;

/// Diversity re-ranker defaults.
pub const DEFAULT_MAX_CONSECUTIVE: usize = 1;
pub const DEFAULT_MAX_MERCHANT_RATIO: f64 = 0.25;
pub const DEFAULT_MAX_CATEGORY_RATIO: f64 = 0.40;

/// CF trainer hyperparameters.
pub const CF_EPOCHS: usize = 3;
pub const CF_LEARNING_RATE: f64 = 0.025;
pub const CF_L2_REG: f64 = 0.01;
pub const CF_INIT_NOISE: f64 = 0.005;
pub const CF_INTERACTION_WINDOW_DAYS: i64 = 90;
pub const CF_INTERACTION_ROW_CAP: usize = 1_000_000;

/// Popularity aggregator window and row caps.
pub const POPULARITY_WINDOW_DAYS: i64 = 30;
pub const POPULARITY_PRODUCT_CAP: usize = 50_000;
pub const POPULARITY_MERCHANT_CAP: usize = 10_000;

/// Event queue / consumer loop discipline.
pub const QUEUE_POP_TIMEOUT: Duration = Duration::from_secs(1);
pub const QUEUE_IDLE_YIELD: Duration = Duration::from_millis(50);
pub const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Transient-error retry backoff.
pub const TRANSIENT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Per-external-call deadline applied by the ranker.
pub const CALL_DEADLINE: Duration = Duration::from_millis(150);

/// Interaction weight map.
pub fn interaction_weight(kind: crate::models::InteractionType) -> f64 {
    use crate::models::InteractionType::*;
    match kind {
        View => 0.5,
        Click => 1.0,
        Cart => 3.0,
        Purchase => 8.0,
    }
}
