//! Client for the upstream social-media API.
//!
//! The boundary policy is degrade-not-crash: transport errors and
//! malformed payloads yield empty collections instead of failing the
//! aggregation pass. The one escalation path is authorization: a 401
//! invalidates the cached token and the request is retried exactly once
//! with a fresh one before the error is allowed to surface.

use crate::auth::TokenProvider;
use crate::types::{Comment, Post, User};
use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bound on any single upstream request, so a stuck call can never hold a
/// single-flight flag indefinitely.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// UpstreamClient trait
// ============================================================================

#[allow(async_fn_in_trait)]
pub trait UpstreamClient: Send + Sync {
    async fn fetch_users(&self) -> Result<Vec<User>>;
    async fn fetch_posts_for_user(&self, user_id: &str) -> Result<Vec<Post>>;
    async fn fetch_comments_for_post(&self, post_id: &str) -> Result<Vec<Comment>>;
}

// ============================================================================
// HttpUpstreamClient — REST implementation
// ============================================================================

pub struct HttpUpstreamClient<T> {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<T>,
}

impl<T: TokenProvider> HttpUpstreamClient<T> {
    pub fn new(base_url: String, tokens: Arc<T>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url,
            tokens,
        }
    }

    /// GET `path` with a bearer token attached. On a 401 that has not yet
    /// been retried, invalidate the token and reissue the request once
    /// with a fresh one; a second failure propagates.
    async fn get_json(&self, path: &str) -> Result<Value> {
        let mut retried = false;
        loop {
            let token = self.tokens.bearer_token().await?;
            let resp = self
                .http
                .get(format!("{}{}", self.base_url, path))
                .bearer_auth(&token)
                .send()
                .await?;

            if resp.status() == StatusCode::UNAUTHORIZED && !retried {
                warn!(path, "unauthorized response, refreshing token and retrying once");
                self.tokens.invalidate().await;
                retried = true;
                continue;
            }

            let resp = resp
                .error_for_status()
                .with_context(|| format!("GET {} failed", path))?;
            return resp
                .json()
                .await
                .with_context(|| format!("GET {} returned unparseable body", path));
        }
    }
}

impl<T: TokenProvider> UpstreamClient for HttpUpstreamClient<T> {
    async fn fetch_users(&self) -> Result<Vec<User>> {
        info!("fetching users");
        match self.get_json("/users").await {
            Ok(body) => Ok(parse_users(&body)),
            Err(e) => {
                error!(error = %e, "error fetching users");
                Ok(Vec::new())
            }
        }
    }

    async fn fetch_posts_for_user(&self, user_id: &str) -> Result<Vec<Post>> {
        if user_id.is_empty() {
            return Ok(Vec::new());
        }
        match self.get_json(&format!("/users/{}/posts", user_id)).await {
            Ok(body) => Ok(parse_posts(&body)),
            Err(e) => {
                error!(error = %e, user_id, "error fetching posts for user");
                Ok(Vec::new())
            }
        }
    }

    async fn fetch_comments_for_post(&self, post_id: &str) -> Result<Vec<Comment>> {
        if post_id.is_empty() {
            return Ok(Vec::new());
        }
        match self.get_json(&format!("/posts/{}/comments", post_id)).await {
            Ok(body) => Ok(parse_comments(&body)),
            Err(e) => {
                // Deliberately quiet: a failed comment fetch is
                // indistinguishable from a post with zero comments.
                debug!(error = %e, post_id, "error fetching comments for post");
                Ok(Vec::new())
            }
        }
    }
}

// ============================================================================
// Payload parsing
// ============================================================================

/// `{"users": {"<id>": "<name>", ...}}`. Anything else (missing field,
/// null, or an array where the map should be) reads as no users.
/// Map iteration preserves upstream insertion order, which downstream
/// treats as the seed order for the user-post-counts view.
fn parse_users(body: &Value) -> Vec<User> {
    let Some(users) = body.get("users").and_then(Value::as_object) else {
        warn!("unexpected users payload shape, treating as empty");
        return Vec::new();
    };

    users
        .iter()
        .map(|(id, name)| User {
            id: id.clone(),
            name: match name {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        })
        .collect()
}

/// `{"posts": [{"id", "userid", "content"}, ...]}`. Ids arrive as strings
/// or numbers and are coerced to strings for consistent map-keying;
/// entries without an id or owner id are dropped.
fn parse_posts(body: &Value) -> Vec<Post> {
    let Some(posts) = body.get("posts").and_then(Value::as_array) else {
        return Vec::new();
    };

    posts
        .iter()
        .filter_map(|post| {
            Some(Post {
                id: id_string(post.get("id")?)?,
                userid: id_string(post.get("userid")?)?,
                content: post
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                comment_count: None,
            })
        })
        .collect()
}

/// `{"comments": [{"id", "postId"}, ...]}` with the same id coercion.
/// Every array element yields a comment: only the count matters
/// downstream, so an entry with missing ids still counts (ids coerce to
/// empty strings) rather than silently lowering a post's comment count.
fn parse_comments(body: &Value) -> Vec<Comment> {
    let Some(comments) = body.get("comments").and_then(Value::as_array) else {
        return Vec::new();
    };

    comments
        .iter()
        .map(|comment| Comment {
            id: comment.get("id").and_then(id_string).unwrap_or_default(),
            post_id: comment.get("postId").and_then(id_string).unwrap_or_default(),
        })
        .collect()
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// Test utilities
// ============================================================================
