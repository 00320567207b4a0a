//! Time-bounded cache for the derived analytics views.
//!
//! The store holds one typed slot per view, keyed by the names the rest of
//! the system (and the logs) use. Expiry is lazy: an entry past its
//! deadline is reported as absent at read time, no background sweep.
//! An absent slot is distinct from a cached empty list; callers use that
//! to tell "not yet computed" apart from "computed, nothing there".

use crate::types::{Post, UserPostCount};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

/// A single TTL-bounded cache entry. Writes overwrite unconditionally;
/// reads return a clone of the last value installed, or `None` once the
/// TTL has lapsed.
pub struct CacheSlot<T> {
    name: &'static str,
    inner: RwLock<Option<Entry<T>>>,
}

impl<T: Clone> CacheSlot<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(None),
        }
    }

    pub fn set(&self, value: T, ttl: Duration) {
        let mut slot = self.inner.write().expect("cache lock poisoned");
        *slot = Some(Entry {
            value,
            expires_at: Instant::now() + ttl,
        });
        debug!(key = self.name, ttl_secs = ttl.as_secs(), "cache entry installed");
    }

    pub fn get(&self) -> Option<T> {
        let slot = self.inner.read().expect("cache lock poisoned");
        match slot.as_ref() {
            Some(entry) if Instant::now() <= entry.expires_at => Some(entry.value.clone()),
            Some(_) => {
                debug!(key = self.name, "cache entry expired");
                None
            }
            None => None,
        }
    }
}

/// The three views the aggregation engine maintains.
///
/// Write access belongs to the engine alone; the query service only reads.
/// Constructed once at startup and shared via `Arc`.
pub struct CacheStore {
    pub user_post_counts: CacheSlot<Vec<UserPostCount>>,
    pub all_posts_with_comments: CacheSlot<Vec<Post>>,
    pub latest_posts: CacheSlot<Vec<Post>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            user_post_counts: CacheSlot::new("userPostCounts"),
            all_posts_with_comments: CacheSlot::new("allPostsWithComments"),
            latest_posts: CacheSlot::new("latestPostsOnly"),
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}
