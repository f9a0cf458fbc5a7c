//! Environment-driven configuration.

use crate::constants::DEFAULT_LATENT_DIM;

/// Process-wide configuration, loaded once at binary startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// `LATENT_DIM` — latent vector dimension (D).
    pub latent_dim: usize,
    /// `REDIS_URL` — cache endpoint.
    pub redis_url: String,
    /// Store endpoint. SQLite file path for this implementation.
    pub database_path: String,
    /// HTTP port for `feedcore-server`.
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let latent_dim = std::env::var("LATENT_DIM")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&d: &usize| d > 0)
            .unwrap_or(DEFAULT_LATENT_DIM);

        let redis_url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let database_path =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "./feedcore.db".to_string());

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        Self {
            latent_dim,
            redis_url,
            database_path,
            port,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            latent_dim: DEFAULT_LATENT_DIM,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_path: "./feedcore.db".to_string(),
            port: 8080,
        }
    }
}

/// Initialize the process-wide `tracing` subscriber. Idempotent-ish: safe
/// to call once per binary `main()`.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.latent_dim, 32);
        assert_eq!(cfg.redis_url, "redis://127.0.0.1:6379");
    }
}
