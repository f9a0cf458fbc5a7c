//! Diversity re-ranker: merchant/category quota enforcement for a feed page.

use crate::constants::{
    DEFAULT_MAX_CATEGORY_RATIO, DEFAULT_MAX_CONSECUTIVE, DEFAULT_MAX_MERCHANT_RATIO,
};

#[derive(Debug, Clone, Copy)]
pub struct DiversityPolicy {
    pub max_consecutive: usize,
    pub max_merchant_ratio: f64,
    pub max_category_ratio: f64,
}

impl Default for DiversityPolicy {
    fn default() -> Self {
        Self {
            max_consecutive: DEFAULT_MAX_CONSECUTIVE,
            max_merchant_ratio: DEFAULT_MAX_MERCHANT_RATIO,
            max_category_ratio: DEFAULT_MAX_CATEGORY_RATIO,
        }
    }
}

/// Anything the diversity re-ranker needs to know about a scored candidate.
/// The ranker passes product ids alongside merchant/category so the
/// re-ranker stays agnostic of the full `Product`/`FeedItem` shape.
pub trait Diversifiable {
    fn merchant_id(&self) -> &str;
    fn category_id(&self) -> &str;
}

/// Re-order a score-sorted `items` (descending by whatever score criterion
/// the caller already sorted on) to satisfy merchant/category quotas,
/// relaxing to score order only when no candidate in the remaining pool
/// qualifies. Deterministic given the input order.
pub fn diversify<T: Diversifiable>(items: Vec<T>, policy: DiversityPolicy) -> Vec<T> {
    let n = items.len();
    if n == 0 {
        return items;
    }
    let merchant_max = (n as f64 * policy.max_merchant_ratio).ceil() as usize;
    let category_max = (n as f64 * policy.max_category_ratio).ceil() as usize;

    let mut pool: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let mut output = Vec::with_capacity(n);
    let mut merchant_counts: std::collections::HashMap<String, usize> = Default::default();
    let mut category_counts: std::collections::HashMap<String, usize> = Default::default();
    let mut tail_merchant: Option<String> = None;
    let mut tail_run = 0usize;

    while output.len() < n {
        let mut chosen_index = None;
        for (idx, slot) in pool.iter().enumerate() {
            let Some(item) = slot else { continue };
            let merchant_ok =
                merchant_counts.get(item.merchant_id()).copied().unwrap_or(0) < merchant_max;
            let category_ok =
                category_counts.get(item.category_id()).copied().unwrap_or(0) < category_max;
            let run_ok = !(tail_merchant.as_deref() == Some(item.merchant_id())
                && tail_run >= policy.max_consecutive);
            if merchant_ok && category_ok && run_ok {
                chosen_index = Some(idx);
                break;
            }
        }
        // Relaxation: no candidate satisfies every constraint, so the
        // constraints become advisory and the pool head is taken as-is.
        let chosen_index = chosen_index.unwrap_or_else(|| {
            pool.iter().position(|slot| slot.is_some()).expect("pool non-empty while output < n")
        });

        let item = pool[chosen_index].take().expect("slot checked Some above");
        *merchant_counts.entry(item.merchant_id().to_string()).or_insert(0) += 1;
        *category_counts.entry(item.category_id().to_string()).or_insert(0) += 1;
        if tail_merchant.as_deref() == Some(item.merchant_id()) {
            tail_run += 1;
        } else {
            tail_merchant = Some(item.merchant_id().to_string());
            tail_run = 1;
        }
        output.push(item);
    }

    output
}
