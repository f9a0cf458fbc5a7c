//! Error kinds for the ranking core.
//!
//! Mirrors the shape of `flux::error`/`kaos::error`: a single enum with
//! `#[from]` conversions at the edges, consulted by callers that need to
//! decide whether to degrade, retry, or propagate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Reject at the boundary (HTTP 400 equivalent). Never triggers a retry.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The KV cache could not be reached or returned a protocol error.
    /// Callers degrade: skip the cache read, fall back to the store/neutral
    /// defaults, and keep going.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The relational store could not be reached. In the ranker, callers
    /// proceed with whatever candidates/meta are already in hand; in the
    /// event consumer, the step is logged and dropped.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Worth exactly one retry after a short backoff before being treated
    /// as the underlying `CacheUnavailable`/`StoreUnavailable`.
    #[error("transient failure: {0}")]
    Transient(String),

    /// An external cache/store call did not complete within its deadline.
    /// Callers degrade exactly like `CacheUnavailable`/`StoreUnavailable`.
    #[error("call exceeded deadline: {0}")]
    DeadlineExceeded(String),

    /// Programmer error. Acceptable to panic/abort inside a worker binary;
    /// must never surface from the ranker's public entry point.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<redis::RedisError> for CoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
            CoreError::Transient(e.to_string())
        } else {
            CoreError::CacheUnavailable(e.to_string())
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::InvalidInput(e.to_string())
    }
}

/// Run `f` once, and on a `Transient` error retry exactly once after the
/// standard backoff. Any other error, or a second failure, propagates.
pub async fn retry_once<T, F, Fut>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    match f().await {
        Err(CoreError::Transient(reason)) => {
            tracing::warn!(reason = %reason, "transient failure, retrying once");
            tokio::time::sleep(crate::constants::TRANSIENT_RETRY_BACKOFF).await;
            f().await
        }
        other => other,
    }
}
