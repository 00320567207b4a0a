//! The aggregation-and-cache refresh engine.
//!
//! Pulls users, posts, and comment counts from the upstream API, joins
//! them into the derived views, and installs those views into the cache
//! store. Two independent single-flight guards keep overlapping triggers
//! from doubling upstream traffic: a second `refresh_all` is dropped,
//! while a second `refresh_latest_only` is answered with whatever is
//! currently cached (the query path behind it needs *some* value now).

use crate::cache::CacheStore;
use crate::types::{Post, UserPostCount};
use crate::upstream::UpstreamClient;
use anyhow::Result;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

/// TTL for the user-post-counts view.
const USER_COUNTS_TTL: Duration = Duration::from_secs(120);
/// TTL for the all-posts-with-comments view.
const POSTS_TTL: Duration = Duration::from_secs(30);
/// TTL for the latest-posts view.
const LATEST_TTL: Duration = Duration::from_secs(15);

/// How many posts the latest-posts view keeps.
const LATEST_POST_LIMIT: usize = 5;

/// Clears a single-flight flag when dropped, so the flag is released on
/// every exit path of a pass, including early exits and errors.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct AggregationEngine<U> {
    upstream: Arc<U>,
    cache: Arc<CacheStore>,
    full_refresh_running: AtomicBool,
    latest_refresh_running: AtomicBool,
}

impl<U: UpstreamClient> AggregationEngine<U> {
    pub fn new(upstream: Arc<U>, cache: Arc<CacheStore>) -> Self {
        Self {
            upstream,
            cache,
            full_refresh_running: AtomicBool::new(false),
            latest_refresh_running: AtomicBool::new(false),
        }
    }

    /// Run a full aggregation pass: users, posts fan-out, comment-count
    /// join, then install the user-post-counts and all-posts views.
    ///
    /// If a full pass is already in flight the trigger is dropped without
    /// waiting or erroring. A pass that fails mid-way is logged and aborted;
    /// views committed earlier in the same pass stand, and anything else
    /// keeps serving the previous pass's value until its TTL lapses.
    pub async fn refresh_all(&self) {
        if self
            .full_refresh_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("full refresh already in flight, dropping trigger");
            return;
        }
        let _guard = FlagGuard(&self.full_refresh_running);

        info!("starting full aggregation pass");
        if let Err(e) = self.run_full_pass().await {
            error!(error = %e, "aggregation pass failed, keeping previously cached views");
        }
    }

    async fn run_full_pass(&self) -> Result<()> {
        let users = self.upstream.fetch_users().await?;
        if users.is_empty() {
            self.cache.user_post_counts.set(Vec::new(), USER_COUNTS_TTL);
            self.cache
                .all_posts_with_comments
                .set(Vec::new(), POSTS_TTL);
            return Ok(());
        }

        let all_posts = self.fetch_all_posts(users.iter().map(|u| u.id.as_str())).await?;

        if all_posts.is_empty() {
            let counts = users
                .iter()
                .map(|user| UserPostCount {
                    name: user.name.clone(),
                    post_count: 0,
                })
                .collect();
            self.cache.user_post_counts.set(counts, USER_COUNTS_TTL);
            self.cache
                .all_posts_with_comments
                .set(Vec::new(), POSTS_TTL);
            return Ok(());
        }

        let id_to_name: HashMap<&str, &str> = users
            .iter()
            .map(|u| (u.id.as_str(), u.name.as_str()))
            .collect();
        let counts = count_posts_per_user(users.iter().map(|u| u.id.as_str()), &all_posts);
        let view = counts
            .into_iter()
            .map(|(user_id, post_count)| UserPostCount {
                name: match id_to_name.get(user_id.as_str()) {
                    Some(name) => (*name).to_string(),
                    None => format!("Unknown User ({})", user_id),
                },
                post_count,
            })
            .collect();
        self.cache.user_post_counts.set(view, USER_COUNTS_TTL);

        let joins = all_posts
            .iter()
            .map(|post| self.join_comment_count(post))
            .collect::<Vec<_>>();
        let joined = join_all(joins)
            .await
            .into_iter()
            .collect::<Result<Vec<Post>>>()?;

        info!(posts = joined.len(), "installed all-posts view");
        self.cache.all_posts_with_comments.set(joined, POSTS_TTL);
        Ok(())
    }

    async fn join_comment_count(&self, post: &Post) -> Result<Post> {
        let comments = self.upstream.fetch_comments_for_post(&post.id).await?;
        Ok(post.clone().with_comment_count(comments.len() as u32))
    }

    /// Lighter pass maintaining only the latest-posts view: users, posts
    /// fan-out, sort by numeric id descending, keep the top 5 with no
    /// comment counts attached.
    ///
    /// Unlike `refresh_all`, an overlapping trigger returns the current
    /// cached value (possibly `None`) instead of no-op'ing. On success the
    /// freshly installed view is returned; on failure, `None`.
    pub async fn refresh_latest_only(&self) -> Option<Vec<Post>> {
        if self
            .latest_refresh_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("latest refresh already in flight, serving cached value");
            return self.cache.latest_posts.get();
        }
        let _guard = FlagGuard(&self.latest_refresh_running);

        match self.run_latest_pass().await {
            Ok(posts) => Some(posts),
            Err(e) => {
                error!(error = %e, "latest-posts pass failed");
                None
            }
        }
    }

    async fn run_latest_pass(&self) -> Result<Vec<Post>> {
        let users = self.upstream.fetch_users().await?;
        if users.is_empty() {
            self.cache.latest_posts.set(Vec::new(), LATEST_TTL);
            return Ok(Vec::new());
        }

        let mut all_posts = self.fetch_all_posts(users.iter().map(|u| u.id.as_str())).await?;

        if all_posts.is_empty() {
            self.cache.latest_posts.set(Vec::new(), LATEST_TTL);
            return Ok(Vec::new());
        }

        // Higher numeric id = more recent. Stable sort, so equal ids keep
        // their fetch order.
        all_posts.sort_by_key(|post| std::cmp::Reverse(numeric_id(&post.id)));
        all_posts.truncate(LATEST_POST_LIMIT);

        self.cache.latest_posts.set(all_posts.clone(), LATEST_TTL);
        Ok(all_posts)
    }

    /// Fan out a posts fetch per user and flatten. An error from any
    /// branch aborts the whole pass.
    async fn fetch_all_posts<'a>(
        &self,
        user_ids: impl Iterator<Item = &'a str>,
    ) -> Result<Vec<Post>> {
        let fetches = user_ids
            .map(|id| self.upstream.fetch_posts_for_user(id))
            .collect::<Vec<_>>();
        let mut all_posts = Vec::new();
        for result in join_all(fetches).await {
            all_posts.extend(result?);
        }
        Ok(all_posts)
    }
}

/// Count posts per owner, seeded with every known user at 0 in the given
/// order. A post whose owner is not in the seed set appends a new entry
/// (after all seeded users, in first-seen order) rather than inflating a
/// known user's count; posts with an empty owner id are skipped.
fn count_posts_per_user<'a>(
    seed_ids: impl Iterator<Item = &'a str>,
    posts: &[Post],
) -> Vec<(String, u64)> {
    let mut order: Vec<String> = seed_ids.map(str::to_string).collect();
    let mut counts: HashMap<String, u64> = order.iter().map(|id| (id.clone(), 0)).collect();

    for post in posts {
        if post.userid.is_empty() {
            continue;
        }
        match counts.get_mut(&post.userid) {
            Some(count) => *count += 1,
            None => {
                order.push(post.userid.clone());
                counts.insert(post.userid.clone(), 1);
            }
        }
    }

    order
        .into_iter()
        .map(|id| {
            let count = counts[&id];
            (id, count)
        })
        .collect()
}

/// Numeric interpretation of a post id for recency ordering. Ids that
/// don't parse sort behind every parseable id.
fn numeric_id(id: &str) -> i64 {
    id.parse().unwrap_or(i64::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::test_utils::FakeUpstream;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn engine(upstream: FakeUpstream) -> (AggregationEngine<FakeUpstream>, Arc<FakeUpstream>, Arc<CacheStore>) {
        let upstream = Arc::new(upstream);
        let cache = Arc::new(CacheStore::new());
        let engine = AggregationEngine::new(Arc::clone(&upstream), Arc::clone(&cache));
        (engine, upstream, cache)
    }

    // -----------------------------------------------------------------------
    // refresh_all
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn full_pass_builds_counts_and_joined_posts() {
        let (engine, upstream, cache) = engine(
            FakeUpstream::new()
                .with_user("u1", "Alice")
                .with_user("u2", "Bob")
                .with_post("u1", Post::new("10", "u1", "first"))
                .with_post("u2", Post::new("11", "u2", "second"))
                .with_post("u1", Post::new("12", "u1", "third"))
                .with_comment_count("10", 3)
                .with_comment_count("11", 1),
        );

        engine.refresh_all().await;

        let counts = cache.user_post_counts.get().unwrap();
        assert_eq!(
            counts,
            vec![
                UserPostCount { name: "Alice".into(), post_count: 2 },
                UserPostCount { name: "Bob".into(), post_count: 1 },
            ]
        );

        let posts = cache.all_posts_with_comments.get().unwrap();
        assert_eq!(posts.len(), 3);
        let by_id = |id: &str| posts.iter().find(|p| p.id == id).unwrap();
        assert_eq!(by_id("10").comment_count, Some(3));
        assert_eq!(by_id("11").comment_count, Some(1));
        assert_eq!(by_id("12").comment_count, Some(0));

        // One comments fetch per post.
        let mut fetched = upstream.fetched_post_ids.lock().unwrap().clone();
        fetched.sort();
        assert_eq!(fetched, vec!["10", "11", "12"]);
    }

    #[tokio::test]
    async fn no_users_installs_empty_views() {
        let (engine, _, cache) = engine(FakeUpstream::new());

        engine.refresh_all().await;

        assert_eq!(cache.user_post_counts.get(), Some(Vec::new()));
        assert_eq!(cache.all_posts_with_comments.get(), Some(Vec::new()));
        assert_eq!(cache.latest_posts.get(), None);
    }

    #[tokio::test]
    async fn no_posts_installs_zero_counts_for_every_user() {
        let (engine, _, cache) = engine(
            FakeUpstream::new()
                .with_user("u1", "Alice")
                .with_user("u2", "Bob"),
        );

        engine.refresh_all().await;

        let counts = cache.user_post_counts.get().unwrap();
        assert_eq!(
            counts,
            vec![
                UserPostCount { name: "Alice".into(), post_count: 0 },
                UserPostCount { name: "Bob".into(), post_count: 0 },
            ]
        );
        assert_eq!(cache.all_posts_with_comments.get(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn unknown_post_owner_gets_fallback_name_entry() {
        let (engine, _, cache) = engine(
            FakeUpstream::new()
                .with_user("u1", "Alice")
                .with_post("u1", Post::new("1", "u1", "mine"))
                .with_post("u1", Post::new("2", "ghost", "whose?")),
        );

        engine.refresh_all().await;

        let counts = cache.user_post_counts.get().unwrap();
        assert_eq!(
            counts,
            vec![
                UserPostCount { name: "Alice".into(), post_count: 1 },
                UserPostCount { name: "Unknown User (ghost)".into(), post_count: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn overlapping_full_refreshes_collapse_to_one_fetch_pass() {
        let (engine, upstream, cache) = engine(
            FakeUpstream::new()
                .with_user("u1", "Alice")
                .with_users_delay(Duration::from_millis(10)),
        );

        tokio::join!(engine.refresh_all(), engine.refresh_all());

        assert_eq!(upstream.users_calls.load(AtomicOrdering::SeqCst), 1);
        assert!(cache.user_post_counts.get().is_some());
    }

    #[tokio::test]
    async fn posts_stage_failure_aborts_pass_and_preserves_stale_views() {
        let (engine, _, cache) = engine(
            FakeUpstream::new()
                .with_user("u1", "Alice")
                .failing_posts(),
        );
        cache.user_post_counts.set(
            vec![UserPostCount { name: "Old".into(), post_count: 9 }],
            Duration::from_secs(60),
        );

        engine.refresh_all().await;

        // Pass aborted before any view was overwritten.
        let counts = cache.user_post_counts.get().unwrap();
        assert_eq!(counts[0].name, "Old");
    }

    #[tokio::test]
    async fn comments_stage_failure_keeps_counts_committed_earlier_in_pass() {
        let (engine, _, cache) = engine(
            FakeUpstream::new()
                .with_user("u1", "Alice")
                .with_post("u1", Post::new("1", "u1", "post"))
                .failing_comments(),
        );
        cache.all_posts_with_comments.set(
            vec![Post::new("old", "u0", "stale").with_comment_count(2)],
            Duration::from_secs(60),
        );

        engine.refresh_all().await;

        // The counts view was installed before the comments join failed...
        assert_eq!(cache.user_post_counts.get().unwrap()[0].post_count, 1);
        // ...and the posts view keeps the earlier pass's value.
        let posts = cache.all_posts_with_comments.get().unwrap();
        assert_eq!(posts[0].id, "old");
    }

    #[tokio::test]
    async fn flag_released_after_failed_pass() {
        let upstream = Arc::new(
            FakeUpstream::new()
                .with_user("u1", "Alice")
                .failing_posts(),
        );
        let cache = Arc::new(CacheStore::new());
        let engine = AggregationEngine::new(Arc::clone(&upstream), Arc::clone(&cache));

        engine.refresh_all().await;
        assert!(!engine.full_refresh_running.load(AtomicOrdering::SeqCst));

        // A subsequent trigger runs a fresh pass rather than being dropped.
        engine.refresh_all().await;
        assert_eq!(upstream.users_calls.load(AtomicOrdering::SeqCst), 2);
    }

    // -----------------------------------------------------------------------
    // refresh_latest_only
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn latest_pass_keeps_top_five_by_numeric_id_descending() {
        let mut upstream = FakeUpstream::new().with_user("u1", "Alice");
        for id in ["3", "12", "7", "25", "1", "9", "18"] {
            upstream = upstream.with_post("u1", Post::new(id, "u1", "p"));
        }
        let (engine, _, cache) = engine(upstream);

        let latest = engine.refresh_latest_only().await.unwrap();

        let ids: Vec<&str> = latest.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["25", "18", "12", "9", "7"]);
        assert!(latest.iter().all(|p| p.comment_count.is_none()));
        assert_eq!(cache.latest_posts.get().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn latest_pass_with_no_posts_installs_empty_view() {
        let (engine, _, cache) = engine(FakeUpstream::new().with_user("u1", "Alice"));

        let latest = engine.refresh_latest_only().await.unwrap();

        assert!(latest.is_empty());
        assert_eq!(cache.latest_posts.get(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn overlapping_latest_refresh_serves_cached_value() {
        let (engine, upstream, cache) = engine(FakeUpstream::new().with_user("u1", "Alice"));
        cache
            .latest_posts
            .set(vec![Post::new("42", "u1", "cached")], Duration::from_secs(60));
        engine
            .latest_refresh_running
            .store(true, AtomicOrdering::SeqCst);

        let latest = engine.refresh_latest_only().await.unwrap();

        assert_eq!(latest[0].id, "42");
        assert_eq!(upstream.users_calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn latest_and_full_guards_are_independent() {
        let (engine, upstream, _) = engine(FakeUpstream::new().with_user("u1", "Alice"));
        engine
            .full_refresh_running
            .store(true, AtomicOrdering::SeqCst);

        // The full-refresh flag does not block a latest pass.
        let latest = engine.refresh_latest_only().await;

        assert!(latest.is_some());
        assert_eq!(upstream.users_calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unparseable_ids_sort_behind_numeric_ones() {
        let (engine, _, _) = engine(
            FakeUpstream::new()
                .with_user("u1", "Alice")
                .with_post("u1", Post::new("abc", "u1", "odd"))
                .with_post("u1", Post::new("2", "u1", "real")),
        );

        let latest = engine.refresh_latest_only().await.unwrap();

        assert_eq!(latest[0].id, "2");
        assert_eq!(latest[1].id, "abc");
    }

    // -----------------------------------------------------------------------
    // count_posts_per_user
    // -----------------------------------------------------------------------

    #[test]
    fn counts_skip_posts_with_empty_owner() {
        let posts = vec![
            Post::new("1", "u1", "a"),
            Post::new("2", "", "orphan"),
        ];
        let counts = count_posts_per_user(["u1"].into_iter(), &posts);
        assert_eq!(counts, vec![("u1".to_string(), 1)]);
    }

    #[test]
    fn count_sum_matches_owned_posts_over_random_inputs() {
        // Small deterministic PRNG, no external crate needed.
        let mut seed: u64 = 0x9E3779B97F4A7C15;
        let mut next = move |bound: u64| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed % bound
        };

        for _ in 0..50 {
            let user_count = next(8) as usize;
            let user_ids: Vec<String> = (0..user_count).map(|i| format!("u{}", i)).collect();

            let post_count = next(40) as usize;
            let posts: Vec<Post> = (0..post_count)
                .map(|i| {
                    // Mix known owners, unknown owners, and empty owners.
                    let owner = match next(4) {
                        0 => String::new(),
                        1 => format!("stranger{}", next(3)),
                        _ if user_count > 0 => format!("u{}", next(user_count as u64)),
                        _ => String::new(),
                    };
                    Post::new(&i.to_string(), &owner, "content")
                })
                .collect();

            let counts =
                count_posts_per_user(user_ids.iter().map(String::as_str), &posts);

            let owned = posts.iter().filter(|p| !p.userid.is_empty()).count() as u64;
            let total: u64 = counts.iter().map(|(_, c)| c).sum();
            assert_eq!(total, owned, "sum of counts must match owned posts");

            // Every seeded user is present, in seed order, with its true count.
            for (i, id) in user_ids.iter().enumerate() {
                assert_eq!(&counts[i].0, id);
                let actual = posts.iter().filter(|p| &p.userid == id).count() as u64;
                assert_eq!(counts[i].1, actual);
            }
        }
    }
}
