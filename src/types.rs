use serde::{Deserialize, Serialize};

/// A user known to the upstream API. `id` is the join key to posts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
}

/// A post authored by a user.
///
/// `comment_count` is absent until the aggregation engine's comment-join
/// step resolves it; the latest-posts view never carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub userid: String,
    pub content: String,
    #[serde(rename = "commentCount", skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<u32>,
}

/// A comment on a post. Only the count matters downstream; upstream
/// comment content is discarded at the client boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    #[serde(rename = "postId")]
    pub post_id: String,
}

/// Derived view: one entry per user observed in a fetch pass (including
/// zero-post users), in seed order. Sorting for "top N" happens at query
/// time, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPostCount {
    pub name: String,
    #[serde(rename = "postCount")]
    pub post_count: u64,
}

impl Post {
    pub fn new(id: &str, userid: &str, content: &str) -> Self {
        Self {
            id: id.to_string(),
            userid: userid.to_string(),
            content: content.to_string(),
            comment_count: None,
        }
    }

    pub fn with_comment_count(mut self, count: u32) -> Self {
        self.comment_count = Some(count);
        self
    }
}
