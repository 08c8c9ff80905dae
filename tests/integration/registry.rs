//! IP range registry: cache freshness and the fallback chain.

use std::time::{Duration, SystemTime};

use regionscope_services::RangeSource;

use crate::*;

fn ip(s: &str) -> std::net::IpAddr {
    s.parse().unwrap()
}

/// Remote → disk cache → stale cache → built-in, and back.
#[tokio::test]
async fn test_fallback_chain() {
    let dir = temp_dir("chain");
    let cache = dir.join("aws-ip-ranges.json");

    // Nothing reachable, no cache: built-in table.
    let feed = ScriptedFeed::failing();
    let clock = TestClock::at(SystemTime::now());
    let reg = registry(feed.clone(), clock.clone(), Some(cache.clone()));
    assert_eq!(reg.region_of(ip("52.1.2.3")).await.as_deref(), Some("us-east-1"));
    assert_eq!(reg.service_of(ip("54.0.0.1")).await.as_deref(), Some("EC2"));
    assert_eq!(reg.source().await, RangeSource::BuiltIn);
    assert!(!reg.is_member(ip("198.51.100.42")).await);
    assert_eq!(feed.calls(), 1);

    // Still inside the back-off: no new attempt.
    clock.advance(Duration::from_secs(60));
    assert!(!reg.is_member(ip("198.51.100.42")).await);
    assert_eq!(feed.calls(), 1);

    // Network comes back after the back-off: remote wins and is cached.
    feed.set(Some(FEED));
    clock.advance(Duration::from_secs(241));
    assert_eq!(reg.region_of(ip("198.51.100.42")).await.as_deref(), Some("eu-test-1"));
    assert_eq!(reg.source().await, RangeSource::Remote);
    assert_eq!(feed.calls(), 2);
    assert!(cache.exists());

    // A second process with no network reads the fresh cache.
    let offline = ScriptedFeed::failing();
    let reg = registry(offline.clone(), TestClock::at(SystemTime::now()), Some(cache.clone()));
    assert!(reg.is_member(ip("203.0.113.7")).await);
    assert_eq!(reg.source().await, RangeSource::DiskCache);
    assert_eq!(offline.calls(), 0);

    let _ = std::fs::remove_dir_all(&dir);
}

/// Cache written at T is used at T+23h and refetched at T+25h.
#[tokio::test]
async fn test_cache_staleness_boundary() {
    let dir = temp_dir("staleness");
    let cache = dir.join("aws-ip-ranges.json");

    let seed = registry(ScriptedFeed::ok(FEED), TestClock::at(SystemTime::now()), Some(cache.clone()));
    assert_eq!(seed.refresh().await, RangeSource::Remote);
    let mtime = std::fs::metadata(&cache).unwrap().modified().unwrap();

    let feed = ScriptedFeed::ok(FEED);
    let reg = registry(feed.clone(), TestClock::at(mtime + Duration::from_secs(23 * 3600)), Some(cache.clone()));
    assert!(reg.is_member(ip("198.51.100.42")).await);
    assert_eq!(reg.source().await, RangeSource::DiskCache);
    assert_eq!(feed.calls(), 0);

    let feed = ScriptedFeed::ok(FEED);
    let reg = registry(feed.clone(), TestClock::at(mtime + Duration::from_secs(25 * 3600)), Some(cache.clone()));
    assert!(reg.is_member(ip("198.51.100.42")).await);
    assert_eq!(reg.source().await, RangeSource::Remote);
    assert_eq!(feed.calls(), 1);

    // Expired cache with the network down: stale cache beats built-in.
    let reg = registry(
        ScriptedFeed::failing(),
        TestClock::at(SystemTime::now() + Duration::from_secs(48 * 3600)),
        Some(cache.clone()),
    );
    assert!(reg.is_member(ip("198.51.100.42")).await);
    assert_eq!(reg.source().await, RangeSource::StaleCache);

    let _ = std::fs::remove_dir_all(&dir);
}

/// The specific service tag wins over the generic one; IPv6 ranges load.
#[tokio::test]
async fn test_lookup_details() {
    let reg = registry(ScriptedFeed::ok(FEED), TestClock::at(SystemTime::now()), None);

    let m = reg.lookup(ip("198.51.100.42")).await.unwrap();
    assert_eq!(m.service, "GAMELIFT");
    assert_eq!(m.prefix, "198.51.100.0/24");

    assert_eq!(reg.region_of(ip("2001:db8:100::1")).await.as_deref(), Some("eu-west-1"));
    assert_eq!(reg.region_of(ip("::ffff:203.0.113.1")).await.as_deref(), Some("eu-west-1"));
    assert!(!reg.is_member(ip("192.0.2.1")).await);

    let status = reg.status().await;
    assert_eq!(status.source, RangeSource::Remote);
    assert_eq!(status.entries, 4);
}
