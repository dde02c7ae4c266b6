use std::path::PathBuf;

use vrp_adapters::{fetch_and_shape, CommunitySource, FixtureSource};
use vrp_core::{ListingKind, ListingRequest};

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[tokio::test]
async fn hot_fixture_drops_stickied_post_and_keeps_upstream_order() {
    let source = FixtureSource::new(fixtures_root());
    let request = ListingRequest::new(ListingKind::Hot, 3, None).unwrap();

    let rows = fetch_and_shape(&source, "pics", &request).await.unwrap();

    // Five entries requested (three plus the sticky allowance), one of them pinned.
    let ids: Vec<_> = rows.iter().map(|r| r.post_id.as_str()).collect();
    assert_eq!(ids, vec!["1c3b0nd", "1c3cq7e", "1c3dwli", "1c3e1zz"]);
    assert!(rows.iter().all(|r| r.subreddit == "pics"));
    assert!(rows.iter().all(|r| r.subscribers == 30_125_447 && r.active_users == 21_904));
    assert_eq!(rows[0].num_gildings, 2);
    assert_eq!(rows[0].created_ts_utc, "2024-04-13 09:40:34");
}

#[tokio::test]
async fn community_stats_come_from_any_listing_fixture() {
    let source = FixtureSource::new(fixtures_root());
    let stats = source.community("pics").await.unwrap();
    assert_eq!(stats.subscribers, 30_125_447);
    assert!(source.community("movies").await.is_err());
}

#[tokio::test]
async fn missing_listing_fixture_is_an_error() {
    let source = FixtureSource::new(fixtures_root());
    let request = ListingRequest::new(ListingKind::Rising, 25, None).unwrap();
    assert!(fetch_and_shape(&source, "pics", &request).await.is_err());
}
