//! HTTP surface: `GET /feed`, `POST /events`, `GET /health`.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use feedcore::cache::RedisFeatureCache;
use feedcore::config::{init_tracing, Config};
use feedcore::constants::{DEFAULT_LIMIT, MAX_LIMIT, MIN_LIMIT};
use feedcore::error::CoreError;
use feedcore::events::ingest_event;
use feedcore::models::{EventPayload, FeedRequest, FeedResponse};
use feedcore::ranker::FeedRanker;
use feedcore::store::SqliteProductStore;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

struct AppState {
    ranker: FeedRanker<RedisFeatureCache, SqliteProductStore>,
    cache: Arc<RedisFeatureCache>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env();

    let cache = Arc::new(RedisFeatureCache::connect(&config.redis_url).await?);
    let store = Arc::new(SqliteProductStore::open(&config.database_path)?);
    let ranker = FeedRanker::new(cache.clone(), store);
    let state = Arc::new(AppState { ranker, cache });

    let app = Router::new()
        .route("/health", get(health))
        .route("/feed", get(get_feed))
        .route("/events", post(post_event))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr, "feedcore-server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct FeedQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "q")]
    search_text: Option<String>,
    #[serde(rename = "categoryId")]
    category_id: Option<String>,
    cursor: Option<String>,
    limit: Option<usize>,
}

async fn get_feed(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<FeedResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(MIN_LIMIT, MAX_LIMIT);
    let request = FeedRequest {
        user_id: query.user_id,
        search_text: query.search_text,
        category_id: query.category_id,
        cursor: query.cursor,
        limit,
        session_id: query.session_id,
    };
    let response = state.ranker.get_feed(&request).await?;
    Ok(Json(response))
}

async fn post_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<EventPayload>,
) -> Result<StatusCode, ApiError> {
    ingest_event(state.cache.as_ref(), &event).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Wraps `CoreError` for the HTTP boundary: invalid input is the only
/// variant that should ever reach a client as 4xx; everything else
/// the ranker already degrades internally, so surfacing it here means the
/// degradation itself failed and the request can't be served.
struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.0 {
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}
