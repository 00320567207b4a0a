//! HTTP API handler for the analytics endpoints.
//!
//! Framework-agnostic: accepts `ApiRequest`, returns `ApiResponse`.
//! The server entry point in `src/main.rs` adapts `axum` types to/from
//! these and calls `handle`.

mod handlers;

use crate::query::QueryService;
use crate::upstream::UpstreamClient;
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Request / Response types
// ============================================================================

pub struct ApiRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
}

pub enum ApiResponse {
    Json { status: u16, body: String },
    Text { status: u16, body: String },
}

impl ApiResponse {
    pub fn status(&self) -> u16 {
        match self {
            Self::Json { status, .. } => *status,
            Self::Text { status, .. } => *status,
        }
    }

    pub fn body_contains(&self, s: &str) -> bool {
        match self {
            Self::Json { body, .. } | Self::Text { body, .. } => body.contains(s),
        }
    }
}

// ============================================================================
// Application state
// ============================================================================

pub struct AppState<U> {
    pub(crate) queries: QueryService<U>,
}

impl<U> AppState<U> {
    pub fn new(queries: QueryService<U>) -> Self {
        Self { queries }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

pub async fn handle<U: UpstreamClient>(
    request: &ApiRequest,
    state: &Arc<AppState<U>>,
) -> ApiResponse {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/users") => handlers::top_users_get(state).await,
        ("GET", "/posts") => {
            let type_param = request.query.get("type").map(|s| s.as_str()).unwrap_or("");
            handlers::top_posts_get(state, type_param).await
        }
        _ => ApiResponse::Text {
            status: 404,
            body: "Not Found".to_string(),
        },
    }
}
