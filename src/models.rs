//! Shared data model: products, merchants, interactions, and wire types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A catalog product. Read-mostly in this core; writes belong to catalog
/// ingestion (external).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub title: String,
    pub description: String,
    pub merchant_id: String,
    pub category_id: String,
    pub popularity: f64,
}

/// The subset of `Product` kept in the product meta cache and hydrated
/// onto ranked candidates. Unknown fields on read are ignored (serde's
/// default behavior for structs without `deny_unknown_fields`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMeta {
    pub title: String,
    pub merchant_id: String,
    pub category_id: String,
    pub popularity: f64,
}

impl From<&Product> for ProductMeta {
    fn from(p: &Product) -> Self {
        Self {
            title: p.title.clone(),
            merchant_id: p.merchant_id.clone(),
            category_id: p.category_id.clone(),
            popularity: p.popularity,
        }
    }
}

/// A merchant's aggregate popularity, maintained by the popularity worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Merchant {
    pub id: String,
    pub popularity: f64,
}

/// Beta(alpha, beta) posterior. Both fields are always >= 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaPosterior {
    pub alpha: u32,
    pub beta: u32,
}

impl Default for BetaPosterior {
    fn default() -> Self {
        Self { alpha: 1, beta: 1 }
    }
}

/// Which posterior a bandit key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanditKind {
    Merchant,
    Category,
}

impl BanditKind {
    pub fn cache_key(&self, id: &str) -> String {
        match self {
            BanditKind::Merchant => format!("bandit:merchant:{id}"),
            BanditKind::Category => format!("bandit:category:{id}"),
        }
    }
}

/// Interaction type, with the aggregation weight map attached
/// via `constants::interaction_weight`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InteractionType {
    View,
    Click,
    Cart,
    Purchase,
}

impl InteractionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionType::View => "VIEW",
            InteractionType::Click => "CLICK",
            InteractionType::Cart => "CART",
            InteractionType::Purchase => "PURCHASE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "VIEW" => Some(InteractionType::View),
            "CLICK" => Some(InteractionType::Click),
            "CART" => Some(InteractionType::Cart),
            "PURCHASE" => Some(InteractionType::Purchase),
            _ => None,
        }
    }
}

/// Append-only interaction row. `value` is always 1 on write; the
/// aggregation weight map is applied downstream by the popularity/CF
/// workers, keyed on `interaction_type`, not on this field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: Option<i64>,
    pub user_id: Option<String>,
    pub session_id: String,
    pub product_id: String,
    pub interaction_type: InteractionType,
    pub value: f64,
    pub created_at: DateTime<Utc>,
}

/// Inbound event as produced onto the `events` queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub user_id: Option<String>,
    pub session_id: String,
    pub product_id: String,
    #[serde(rename = "type")]
    pub event_type: InteractionType,
}

/// Ranker request.
#[derive(Debug, Clone, Default)]
pub struct FeedRequest {
    pub user_id: Option<String>,
    pub search_text: Option<String>,
    pub category_id: Option<String>,
    pub cursor: Option<String>,
    pub limit: usize,
    pub session_id: Option<String>,
}

/// A single ranked result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedItem {
    pub score: f64,
    pub product: Product,
}

/// Ranker response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedResponse {
    pub items: Vec<FeedItem>,
    pub cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interaction_type_round_trips_through_its_wire_string() {
        for kind in [
            InteractionType::View,
            InteractionType::Click,
            InteractionType::Cart,
            InteractionType::Purchase,
        ] {
            assert_eq!(InteractionType::from_str(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn beta_posterior_defaults_to_one_one() {
        let p = BetaPosterior::default();
        assert_eq!((p.alpha, p.beta), (1, 1));
    }

    #[test]
    fn product_meta_ignores_fields_not_present_on_product() {
        let p = Product {
            id: "p1".into(),
            title: "Red Shoe".into(),
            description: "A red shoe".into(),
            merchant_id: "m1".into(),
            category_id: "c1".into(),
            popularity: 10.0,
        };
        let meta: ProductMeta = (&p).into();
        assert_eq!(meta.title, "Red Shoe");
        assert_eq!(meta.popularity, 10.0);
    }
}
