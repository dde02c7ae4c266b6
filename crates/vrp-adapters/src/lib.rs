//! Upstream source contracts, fixture/Reddit sources, and listing shaping.

mod reddit;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use vrp_core::{format_utc, ListingKind, ListingRequest, LoadStamp, Row, TimeFilter};

pub use reddit::{RedditClient, RedditClientConfig};

pub const CRATE_NAME: &str = "vrp-adapters";

/// Rising entries older than this are stale.
pub const RISING_WINDOW_MINUTES: i64 = 60;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Community-level counters copied into every row of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityStats {
    pub subscribers: i64,
    pub active_users: i64,
}

/// One listing entry as the upstream API reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamPost {
    pub id: String,
    pub title: String,
    pub score: i64,
    pub num_comments: i64,
    pub upvote_ratio: f64,
    #[serde(default)]
    pub gildings: BTreeMap<String, i64>,
    /// Seconds since the Unix epoch.
    pub created_utc: f64,
    #[serde(default)]
    pub stickied: bool,
}

impl UpstreamPost {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let secs = self.created_utc.floor() as i64;
        let nanos = ((self.created_utc - self.created_utc.floor()) * 1e9) as u32;
        Utc.timestamp_opt(secs, nanos).single()
    }

    pub fn total_gildings(&self) -> i64 {
        self.gildings.values().sum()
    }
}

#[async_trait]
pub trait CommunitySource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn community(&self, name: &str) -> Result<CommunityStats, UpstreamError>;

    async fn listing(
        &self,
        name: &str,
        kind: ListingKind,
        limit: u32,
        time_filter: Option<TimeFilter>,
    ) -> Result<Vec<UpstreamPost>, UpstreamError>;
}

/// Time between post creation and collection, split the way the rising
/// window is judged: whole days, then minutes within the remaining day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed {
    pub days: i64,
    pub minutes: i64,
}

impl Elapsed {
    pub fn between(created: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let delta = now - created;
        // floor, so anything after `now` lands in day -1
        let seconds = delta.num_seconds() - i64::from(delta.subsec_nanos() < 0);
        Self {
            days: seconds.div_euclid(SECONDS_PER_DAY),
            minutes: seconds.rem_euclid(SECONDS_PER_DAY) / 60,
        }
    }

    pub fn is_stale_for_rising(&self) -> bool {
        self.minutes > RISING_WINDOW_MINUTES || self.days > 0
    }
}

/// Filter and reshape one upstream listing into rows anchored at `now`.
///
/// Stickied posts are dropped for every kind; rising posts are dropped once
/// they fall outside the rising window. Upstream order is preserved.
pub fn shape_listing(
    community: &str,
    kind: ListingKind,
    stats: CommunityStats,
    posts: Vec<UpstreamPost>,
    now: DateTime<Utc>,
) -> Result<Vec<Row>, UpstreamError> {
    let stamp = LoadStamp::at(now);
    let mut rows = Vec::with_capacity(posts.len());

    for post in posts {
        if post.stickied {
            debug!(community, post_id = %post.id, "skipping stickied post");
            continue;
        }
        let created = post
            .created_at()
            .with_context(|| format!("post {} has invalid created_utc {}", post.id, post.created_utc))?;
        let elapsed = Elapsed::between(created, now);
        if kind == ListingKind::Rising && elapsed.is_stale_for_rising() {
            debug!(community, post_id = %post.id, ?elapsed, "skipping stale rising post");
            continue;
        }

        let num_gildings = post.total_gildings();
        rows.push(Row {
            post_id: post.id,
            subreddit: community.to_string(),
            subscribers: stats.subscribers,
            active_users: stats.active_users,
            title: post.title,
            created_ts_utc: format_utc(created),
            time_elapsed_min: elapsed.minutes,
            score: post.score,
            num_comments: post.num_comments,
            upvote_ratio: post.upvote_ratio,
            num_gildings,
            load_ts_utc: stamp.ts.clone(),
            load_date_utc: stamp.date.clone(),
            load_time_utc: stamp.time.clone(),
        });
    }
    Ok(rows)
}

/// Query one listing of one community and shape it into rows.
///
/// Asks upstream for a couple of extra entries to cover stickied posts. The
/// result is not truncated back to the requested count.
pub async fn fetch_and_shape(
    source: &dyn CommunitySource,
    community: &str,
    request: &ListingRequest,
) -> Result<Vec<Row>, UpstreamError> {
    let stats = source.community(community).await?;
    info!(
        community,
        subscribers = stats.subscribers,
        active_users = stats.active_users,
        "community stats"
    );
    let posts = source
        .listing(
            community,
            request.kind(),
            request.upstream_limit(),
            request.time_filter(),
        )
        .await?;
    let now = Utc::now().trunc_subsecs(0);
    shape_listing(community, request.kind(), stats, posts, now)
}

/// Listing snapshot stored on disk for offline runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingFixture {
    pub community: CommunityStats,
    pub posts: Vec<UpstreamPost>,
}

/// Serves listings from `<root>/<community>/<kind>.json`.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn fixture_path(&self, community: &str, kind: ListingKind) -> PathBuf {
        self.root.join(community).join(format!("{kind}.json"))
    }

    async fn load(&self, path: &Path) -> Result<ListingFixture, UpstreamError> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let fixture = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(fixture)
    }

    async fn any_fixture(&self, community: &str) -> Result<ListingFixture, UpstreamError> {
        for kind in [ListingKind::Hot, ListingKind::Rising, ListingKind::Top] {
            let path = self.fixture_path(community, kind);
            if fs::try_exists(&path).await.unwrap_or(false) {
                return self.load(&path).await;
            }
        }
        Err(anyhow::anyhow!("no fixtures for community {community} under {}", self.root.display()).into())
    }
}

#[async_trait]
impl CommunitySource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixtures"
    }

    async fn community(&self, name: &str) -> Result<CommunityStats, UpstreamError> {
        Ok(self.any_fixture(name).await?.community)
    }

    async fn listing(
        &self,
        name: &str,
        kind: ListingKind,
        limit: u32,
        _time_filter: Option<TimeFilter>,
    ) -> Result<Vec<UpstreamPost>, UpstreamError> {
        let mut fixture = self.load(&self.fixture_path(name, kind)).await?;
        fixture.posts.truncate(limit as usize);
        Ok(fixture.posts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Mutex;

    fn anchor() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 4, 30, 5, 3, 44).single().unwrap()
    }

    fn post(id: &str, created: DateTime<Utc>, stickied: bool) -> UpstreamPost {
        UpstreamPost {
            id: id.to_string(),
            title: "My son and my ferret. 😂".to_string(),
            score: 28,
            num_comments: 1,
            upvote_ratio: 0.86,
            gildings: BTreeMap::new(),
            created_utc: created.timestamp() as f64,
            stickied,
        }
    }

    fn stats() -> CommunityStats {
        CommunityStats {
            subscribers: 10_000_000,
            active_users: 10_000,
        }
    }

    struct StubSource {
        posts: Vec<UpstreamPost>,
        requested: Mutex<Vec<(ListingKind, u32, Option<TimeFilter>)>>,
    }

    impl StubSource {
        fn new(posts: Vec<UpstreamPost>) -> Self {
            Self {
                posts,
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommunitySource for StubSource {
        fn source_id(&self) -> &'static str {
            "stub"
        }

        async fn community(&self, _name: &str) -> Result<CommunityStats, UpstreamError> {
            Ok(stats())
        }

        async fn listing(
            &self,
            _name: &str,
            kind: ListingKind,
            limit: u32,
            time_filter: Option<TimeFilter>,
        ) -> Result<Vec<UpstreamPost>, UpstreamError> {
            self.requested.lock().unwrap().push((kind, limit, time_filter));
            Ok(self.posts.clone())
        }
    }

    #[test]
    fn rising_post_inside_window_is_kept_with_fields_copied() {
        let now = anchor();
        let rows = shape_listing(
            "pics",
            ListingKind::Rising,
            stats(),
            vec![post("1c3dwli", now - Duration::minutes(15), false)],
            now,
        )
        .unwrap();

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.post_id, "1c3dwli");
        assert_eq!(row.subreddit, "pics");
        assert_eq!(row.subscribers, 10_000_000);
        assert_eq!(row.active_users, 10_000);
        assert_eq!(row.title, "My son and my ferret. 😂");
        assert_eq!(row.time_elapsed_min, 15);
        assert_eq!(row.score, 28);
        assert_eq!(row.num_comments, 1);
        assert_eq!(row.upvote_ratio, 0.86);
        assert_eq!(row.created_ts_utc, "2023-04-30 04:48:44");
        assert_eq!(row.load_ts_utc, "2023-04-30 05:03:44");
        assert_eq!(row.load_date_utc, "2023-04-30");
        assert_eq!(row.load_time_utc, "05:03:44");
    }

    #[test]
    fn rising_post_outside_window_is_dropped() {
        let now = anchor();
        let rows = shape_listing(
            "pics",
            ListingKind::Rising,
            stats(),
            vec![
                post("old", now - Duration::minutes(90), false),
                post("yesterday", now - Duration::days(1) - Duration::minutes(5), false),
                post("edge", now - Duration::minutes(60) - Duration::seconds(59), false),
            ],
            now,
        )
        .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.post_id.as_str()).collect();
        assert_eq!(ids, vec!["edge"]);
    }

    #[test]
    fn old_posts_are_kept_for_hot_listings() {
        let now = anchor();
        let rows = shape_listing(
            "pics",
            ListingKind::Hot,
            stats(),
            vec![post("old", now - Duration::minutes(90), false)],
            now,
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time_elapsed_min, 90);
    }

    #[test]
    fn stickied_posts_are_dropped_for_every_kind() {
        let now = anchor();
        for kind in [ListingKind::Rising, ListingKind::Hot, ListingKind::Top] {
            let rows = shape_listing(
                "pics",
                kind,
                stats(),
                vec![post("pinned", now - Duration::minutes(5), true)],
                now,
            )
            .unwrap();
            assert!(rows.is_empty(), "{kind} kept a stickied post");
        }
    }

    #[test]
    fn gildings_are_summed_across_categories() {
        let now = anchor();
        let mut gilded = post("gilded", now - Duration::minutes(5), false);
        gilded.gildings = BTreeMap::from([
            ("gid_1".to_string(), 2),
            ("gid_2".to_string(), 1),
            ("gid_3".to_string(), 0),
        ]);
        let rows = shape_listing("pics", ListingKind::Hot, stats(), vec![gilded], now).unwrap();
        assert_eq!(rows[0].num_gildings, 3);
    }

    #[test]
    fn elapsed_matches_day_and_minute_split() {
        let now = anchor();
        assert_eq!(
            Elapsed::between(now - Duration::hours(25) - Duration::minutes(3), now),
            Elapsed { days: 1, minutes: 63 }
        );
        // Posts stamped slightly in the future wrap like a negative day.
        let future = Elapsed::between(now + Duration::seconds(30), now);
        assert_eq!(future.days, -1);
        assert_eq!(future.minutes, 1439);
        assert!(future.is_stale_for_rising());

        let sub_second = Elapsed::between(now + Duration::milliseconds(500), now);
        assert_eq!(
            sub_second,
            Elapsed {
                days: -1,
                minutes: 1439
            }
        );
        assert!(sub_second.is_stale_for_rising());
        assert_eq!(
            Elapsed::between(now - Duration::milliseconds(59_500), now),
            Elapsed { days: 0, minutes: 0 }
        );
    }

    #[tokio::test]
    async fn fetch_requests_sticky_allowance_and_keeps_fresh_rising_post() {
        let created = Utc::now().trunc_subsecs(0) - Duration::minutes(15);
        let source = StubSource::new(vec![
            post("pinned", created, true),
            post("1c3dwli", created, false),
        ]);
        let request = ListingRequest::new(ListingKind::Rising, 25, None).unwrap();

        let rows = fetch_and_shape(&source, "pics", &request).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].post_id, "1c3dwli");
        assert_eq!(rows[0].time_elapsed_min, 15);
        assert_eq!(rows[0].subscribers, 10_000_000);
        assert_eq!(
            source.requested.lock().unwrap().as_slice(),
            &[(ListingKind::Rising, 27, None)]
        );
    }

    #[tokio::test]
    async fn fetch_does_not_truncate_to_requested_count() {
        let created = Utc::now().trunc_subsecs(0) - Duration::minutes(30);
        let posts = (0..5).map(|i| post(&format!("p{i}"), created, false)).collect();
        let source = StubSource::new(posts);
        let request = ListingRequest::new(ListingKind::Hot, 3, None).unwrap();

        let rows = fetch_and_shape(&source, "pics", &request).await.unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn fetch_passes_time_filter_for_top() {
        let source = StubSource::new(Vec::new());
        let request = ListingRequest::new(ListingKind::Top, 10, Some(TimeFilter::Week)).unwrap();
        let rows = fetch_and_shape(&source, "news", &request).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(
            source.requested.lock().unwrap().as_slice(),
            &[(ListingKind::Top, 12, Some(TimeFilter::Week))]
        );
    }

    #[test]
    fn created_at_keeps_fractional_seconds() {
        let mut p = post("x", anchor(), false);
        p.created_utc += 0.5;
        let created = p.created_at().unwrap();
        assert_eq!(created.timestamp(), anchor().timestamp());
        assert_eq!(created.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn rising_drops_post_stamped_half_a_second_ahead() {
        let mut ahead = post("ahead", anchor(), false);
        ahead.created_utc += 0.5;
        let on_time = post("on_time", anchor(), false);

        let rows = shape_listing("pics", ListingKind::Rising, stats(), vec![ahead, on_time], anchor())
            .unwrap();

        let ids: Vec<_> = rows.iter().map(|r| r.post_id.as_str()).collect();
        assert_eq!(ids, vec!["on_time"]);
        assert_eq!(rows[0].time_elapsed_min, 0);
    }
}
