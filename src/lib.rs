//! Social-media analytics aggregation service.
//!
//! Periodically pulls users, posts, and comments from an upstream REST
//! API, joins them into derived views (top users by post count, posts by
//! recency and comment count), and serves those views from a TTL-bounded
//! cache with single-flight refresh de-duplication.

pub mod api;
pub mod auth;
pub mod cache;
pub mod engine;
pub mod query;
pub mod scheduler;
pub mod types;
pub mod upstream;
