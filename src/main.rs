use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use social_analytics::api::{self, ApiRequest, ApiResponse, AppState};
use social_analytics::auth::{AuthConfig, AuthTokenProvider};
use social_analytics::cache::CacheStore;
use social_analytics::engine::AggregationEngine;
use social_analytics::query::QueryService;
use social_analytics::scheduler;
use social_analytics::upstream::HttpUpstreamClient;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Period of the background full-refresh loop.
const REFRESH_PERIOD: Duration = Duration::from_secs(60);

type Upstream = HttpUpstreamClient<AuthTokenProvider>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let auth_config = AuthConfig::from_env()?;
    let base_url = env::var("UPSTREAM_BASE_URL")
        .map_err(|_| anyhow::anyhow!("UPSTREAM_BASE_URL environment variable must be set"))?;
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3001);

    let tokens = Arc::new(AuthTokenProvider::new(auth_config));
    let upstream = Arc::new(HttpUpstreamClient::new(base_url, tokens));
    let cache = Arc::new(CacheStore::new());
    let engine = Arc::new(AggregationEngine::new(upstream, Arc::clone(&cache)));

    tokio::spawn(scheduler::run(Arc::clone(&engine), REFRESH_PERIOD));

    let state = Arc::new(AppState::new(QueryService::new(engine, cache)));
    let app = Router::new()
        .route("/users", get(top_users))
        .route("/posts", get(top_posts))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// axum adapters
// ============================================================================

async fn top_users(State(state): State<Arc<AppState<Upstream>>>) -> Response {
    let request = ApiRequest {
        method: "GET".to_string(),
        path: "/users".to_string(),
        query: HashMap::new(),
    };
    into_axum(api::handle(&request, &state).await)
}

async fn top_posts(
    State(state): State<Arc<AppState<Upstream>>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let request = ApiRequest {
        method: "GET".to_string(),
        path: "/posts".to_string(),
        query: params,
    };
    into_axum(api::handle(&request, &state).await)
}

fn into_axum(resp: ApiResponse) -> Response {
    let status = StatusCode::from_u16(resp.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match resp {
        ApiResponse::Json { body, .. } => {
            (status, [(CONTENT_TYPE, "application/json")], body).into_response()
        }
        ApiResponse::Text { body, .. } => (status, body).into_response(),
    }
}
