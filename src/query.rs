//! Read-side queries over the cached views.
//!
//! A query only talks to the upstream indirectly: a true cache miss
//! triggers the matching refresh and the read is retried once. Anything
//! still absent after that surfaces as a retrieval error.

use crate::cache::CacheStore;
use crate::engine::AggregationEngine;
use crate::types::{Post, UserPostCount};
use crate::upstream::UpstreamClient;
use anyhow::{Context, Result, bail};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// How many users `top_users` returns.
const TOP_USER_LIMIT: usize = 5;

// ============================================================================
// PostQuery
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostQuery {
    Latest,
    Popular,
}

impl FromStr for PostQuery {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(Self::Latest),
            "popular" => Ok(Self::Popular),
            other => bail!("invalid post query type: {:?}", other),
        }
    }
}

impl fmt::Display for PostQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Popular => write!(f, "popular"),
        }
    }
}

// ============================================================================
// QueryService
// ============================================================================

pub struct QueryService<U> {
    engine: Arc<AggregationEngine<U>>,
    cache: Arc<CacheStore>,
}

impl<U: UpstreamClient> QueryService<U> {
    pub fn new(engine: Arc<AggregationEngine<U>>, cache: Arc<CacheStore>) -> Self {
        Self { engine, cache }
    }

    /// Top 5 users by post count, descending. The sort is stable, so ties
    /// keep the seed order the view was built in.
    pub async fn top_users(&self) -> Result<Vec<UserPostCount>> {
        let counts = match self.cache.user_post_counts.get() {
            Some(counts) => counts,
            None => {
                self.engine.refresh_all().await;
                self.cache
                    .user_post_counts
                    .get()
                    .context("user post counts unavailable after forced refresh")?
            }
        };

        let mut sorted = counts;
        sorted.sort_by(|a, b| b.post_count.cmp(&a.post_count));
        sorted.truncate(TOP_USER_LIMIT);
        Ok(sorted)
    }

    /// `latest`: the latest-posts view. `popular`: every post tied for the
    /// maximum comment count (an empty post set means an empty result).
    pub async fn top_posts(&self, query: PostQuery) -> Result<Vec<Post>> {
        match query {
            PostQuery::Latest => match self.cache.latest_posts.get() {
                Some(posts) => Ok(posts),
                None => self
                    .engine
                    .refresh_latest_only()
                    .await
                    .context("latest posts unavailable after forced refresh"),
            },
            PostQuery::Popular => {
                let posts = match self.cache.all_posts_with_comments.get() {
                    Some(posts) => posts,
                    None => {
                        self.engine.refresh_all().await;
                        self.cache
                            .all_posts_with_comments
                            .get()
                            .context("posts unavailable after forced refresh")?
                    }
                };

                if posts.is_empty() {
                    return Ok(Vec::new());
                }

                let max = posts
                    .iter()
                    .map(|p| p.comment_count.unwrap_or(0))
                    .max()
                    .unwrap_or(0);
                Ok(posts
                    .into_iter()
                    .filter(|p| p.comment_count.unwrap_or(0) == max)
                    .collect())
            }
        }
    }
}
