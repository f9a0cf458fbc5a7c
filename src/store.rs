//! Relational store collaborator.
//!
//! `SqliteProductStore` wraps a rusqlite connection the way a thin,
//! synchronous data-access layer should: called from async contexts
//! without a dedicated blocking pool, since its transport is out of
//! scope here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::{Interaction, InteractionType, Product};
use crate::search::best_similarity;

#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn get_product(&self, id: &str) -> Result<Option<Product>>;
    async fn get_products_by_ids(&self, ids: &[String]) -> Result<Vec<Product>>;
    async fn top_products_by_popularity(&self, limit: usize) -> Result<Vec<Product>>;
    async fn top_products_by_category(&self, category_id: &str, limit: usize)
        -> Result<Vec<Product>>;
    /// Fuzzy search over title/description. Returns
    /// `(product, score)` pairs, `score` clamped to `[0,1]`, ordered desc.
    async fn search_products(&self, query: &str, limit: usize) -> Result<Vec<(Product, f64)>>;

    async fn append_interaction(&self, interaction: &Interaction) -> Result<()>;
    async fn interactions_since(
        &self,
        since: DateTime<Utc>,
        cap: usize,
    ) -> Result<Vec<Interaction>>;

    async fn set_product_popularity(&self, id: &str, popularity: f64) -> Result<()>;
    async fn set_merchant_popularity(&self, id: &str, popularity: f64) -> Result<()>;

    async fn save_factors(&self, namespace: &str, key: &str, vector: &[f64]) -> Result<()>;
    async fn load_all_factors(&self, namespace: &str) -> Result<HashMap<String, Vec<f64>>>;
}

pub struct SqliteProductStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProductStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS products (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                merchant_id TEXT NOT NULL,
                category_id TEXT NOT NULL,
                popularity REAL NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS merchants (
                id TEXT PRIMARY KEY,
                popularity REAL NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS interactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT,
                session_id TEXT NOT NULL,
                product_id TEXT NOT NULL,
                type TEXT NOT NULL,
                value REAL NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_interactions_created_at ON interactions(created_at);
            CREATE TABLE IF NOT EXISTS feature_store (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            );",
        )?;
        Ok(())
    }

    fn row_to_product(row: &rusqlite::Row) -> rusqlite::Result<Product> {
        Ok(Product {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            merchant_id: row.get(3)?,
            category_id: row.get(4)?,
            popularity: row.get(5)?,
        })
    }

    /// Insert or update a product. Not part of the trait (catalog
    /// ingestion is external); exposed for tests and local seeding.
    pub fn upsert_product(&self, product: &Product) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO products (id, title, description, merchant_id, category_id, popularity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                title=excluded.title, description=excluded.description,
                merchant_id=excluded.merchant_id, category_id=excluded.category_id,
                popularity=excluded.popularity",
            params![
                product.id,
                product.title,
                product.description,
                product.merchant_id,
                product.category_id,
                product.popularity
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl ProductStore for SqliteProductStore {
    async fn get_product(&self, id: &str) -> Result<Option<Product>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, description, merchant_id, category_id, popularity
             FROM products WHERE id = ?1",
        )?;
        let result = stmt.query_row(params![id], Self::row_to_product);
        match result {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_products_by_ids(&self, ids: &[String]) -> Result<Vec<Product>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, title, description, merchant_id, category_id, popularity
             FROM products WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> =
            ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), Self::row_to_product)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    async fn top_products_by_popularity(&self, limit: usize) -> Result<Vec<Product>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, description, merchant_id, category_id, popularity
             FROM products ORDER BY popularity DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_product)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    async fn top_products_by_category(
        &self,
        category_id: &str,
        limit: usize,
    ) -> Result<Vec<Product>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, description, merchant_id, category_id, popularity
             FROM products WHERE category_id = ?1 ORDER BY popularity DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![category_id, limit as i64], Self::row_to_product)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    async fn search_products(&self, query: &str, limit: usize) -> Result<Vec<(Product, f64)>> {
        let products = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT id, title, description, merchant_id, category_id, popularity FROM products",
            )?;
            let rows = stmt.query_map(params![], Self::row_to_product)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut scored: Vec<(Product, f64)> = products
            .into_iter()
            .map(|p| {
                let score = best_similarity(query, &p.title, &p.description);
                (p, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn append_interaction(&self, interaction: &Interaction) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO interactions (user_id, session_id, product_id, type, value, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                interaction.user_id,
                interaction.session_id,
                interaction.product_id,
                interaction.interaction_type.as_str(),
                interaction.value,
                interaction.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn interactions_since(
        &self,
        since: DateTime<Utc>,
        cap: usize,
    ) -> Result<Vec<Interaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, session_id, product_id, type, value, created_at
             FROM interactions WHERE created_at >= ?1 ORDER BY created_at ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since.to_rfc3339(), cap as i64], |row| {
            let type_str: String = row.get(4)?;
            let created_at: String = row.get(6)?;
            Ok(Interaction {
                id: row.get(0)?,
                user_id: row.get(1)?,
                session_id: row.get(2)?,
                product_id: row.get(3)?,
                interaction_type: InteractionType::from_str(&type_str)
                    .unwrap_or(InteractionType::View),
                value: row.get(5)?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    async fn set_product_popularity(&self, id: &str, popularity: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE products SET popularity = ?1 WHERE id = ?2",
            params![popularity, id],
        )?;
        Ok(())
    }

    async fn set_merchant_popularity(&self, id: &str, popularity: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO merchants (id, popularity) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET popularity=excluded.popularity",
            params![id, popularity],
        )?;
        Ok(())
    }

    async fn save_factors(&self, namespace: &str, key: &str, vector: &[f64]) -> Result<()> {
        let conn = self.conn.lock();
        let json = serde_json::to_string(vector)?;
        conn.execute(
            "INSERT INTO feature_store (namespace, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, key) DO UPDATE SET value=excluded.value",
            params![namespace, key, json],
        )?;
        Ok(())
    }

    async fn load_all_factors(&self, namespace: &str) -> Result<HashMap<String, Vec<f64>>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key, value FROM feature_store WHERE namespace = ?1")?;
        let rows = stmt.query_map(params![namespace], |row| {
            let key: String = row.get(0)?;
            let value: String = row.get(1)?;
            Ok((key, value))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (key, value) = row?;
            if let Ok(vector) = serde_json::from_str::<Vec<f64>>(&value) {
                out.insert(key, vector);
            }
        }
        Ok(out)
    }
}
