use super::{ApiResponse, AppState};
use crate::query::PostQuery;
use crate::upstream::UpstreamClient;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

// ============================================================================
// Response helpers
// ============================================================================

fn json_response(status: u16, body: String) -> ApiResponse {
    ApiResponse::Json { status, body }
}

fn json_error(status: u16, message: &str) -> ApiResponse {
    json_response(status, json!({ "error": message }).to_string())
}

// ============================================================================
// Route handlers
// ============================================================================

/// GET /users
///
/// Top 5 users by post count.
pub(super) async fn top_users_get<U: UpstreamClient>(state: &Arc<AppState<U>>) -> ApiResponse {
    match state.queries.top_users().await {
        Ok(users) => json_response(200, json!({ "users": users }).to_string()),
        Err(e) => {
            error!(error = %e, "failed to retrieve top users");
            json_error(500, "Failed to retrieve user data.")
        }
    }
}

/// GET /posts?type=latest|popular
pub(super) async fn top_posts_get<U: UpstreamClient>(
    state: &Arc<AppState<U>>,
    type_param: &str,
) -> ApiResponse {
    let query = match type_param.parse::<PostQuery>() {
        Ok(q) => q,
        Err(e) => {
            warn!(error = %e, "rejected posts query");
            return json_error(
                400,
                "Invalid 'type' query parameter. Use 'latest' or 'popular'.",
            );
        }
    };

    match state.queries.top_posts(query).await {
        Ok(posts) => json_response(200, json!({ "posts": posts }).to_string()),
        Err(e) => {
            error!(error = %e, query = %query, "failed to retrieve posts");
            match query {
                PostQuery::Latest => json_error(500, "Failed to retrieve latest posts data."),
                PostQuery::Popular => json_error(500, "Failed to retrieve popular posts data."),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
