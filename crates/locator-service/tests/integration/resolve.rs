use std::time::{Duration, SystemTime, UNIX_EPOCH};

use locator_service::{LocationInfo, ResolveError, ResolverService};

use crate::utils::{config, setup_service};

#[tokio::test]
async fn test_resolve_end_to_end() {
    locator_test::setup();
    let server = locator_test::lookup_server([("alice", "France")]);
    let dir = locator_test::tempdir();
    let service = setup_service(&config(&server), dir.path()).await;

    let info = service.resolve("alice").await;
    insta::assert_debug_snapshot!(info, @r###"
    LocationInfo {
        value: Some(
            "France",
        ),
        display: Some(
            "République française",
        ),
    }
    "###);
    assert_eq!(service.counts()["France"], 1);

    // answered from the cache
    assert_eq!(service.resolve("alice").await, info);
    assert_eq!(server.hits("alice"), 1);
}

#[tokio::test]
async fn test_unknown_key() {
    locator_test::setup();
    let server = locator_test::lookup_server([]);
    server.set("bob", None);
    let dir = locator_test::tempdir();
    let service = setup_service(&config(&server), dir.path()).await;

    assert_eq!(service.resolve("nobody").await, LocationInfo::default());
    assert_eq!(service.resolve("bob").await, LocationInfo::default());
    assert_eq!(service.cache_len(), 2);

    service.resolve("nobody").await;
    assert_eq!(server.hits("nobody"), 1);
    assert!(service.counts().is_empty());
}

#[tokio::test]
async fn test_concurrent_resolves_hit_once() {
    locator_test::setup();
    let server = locator_test::lookup_server([("carol", "Peru")]);
    server.set_delay(Duration::from_millis(100));
    let dir = locator_test::tempdir();
    let service = setup_service(&config(&server), dir.path()).await;

    let results = service.resolve_many(vec!["carol"; 8]).await;
    for result in results {
        assert_eq!(result.unwrap().value.as_deref(), Some("Peru"));
    }
    assert_eq!(server.hits("carol"), 1);
}

#[tokio::test]
async fn test_throttled_by_remote() {
    locator_test::setup();
    let server = locator_test::lookup_server([("alice", "France")]);
    let reset_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 3600;
    server.throttle(Some(reset_at));
    let dir = locator_test::tempdir();
    let service = setup_service(&config(&server), dir.path()).await;

    let result = service.try_resolve("alice").await;
    assert!(matches!(result, Err(ResolveError::RateLimited { .. })));
    assert_eq!(service.cache_len(), 0);

    // the reported reset is later than the local backoff, so it wins
    let backoff = service.backoff();
    assert_eq!(backoff.consecutive_hits, 1);
    assert!(backoff.reset_in.unwrap() > Duration::from_secs(3500));

    server.stop_throttling();
    let result = service.try_resolve("bob").await;
    assert!(matches!(result, Err(ResolveError::RateLimited { .. })));
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_timeout_is_retryable() {
    locator_test::setup();
    let server = locator_test::lookup_server([("dave", "Chile")]);
    server.set_delay(Duration::from_millis(500));
    let dir = locator_test::tempdir();
    let mut config = config(&server);
    config.remote.timeout = Duration::from_millis(100);
    let service = setup_service(&config, dir.path()).await;

    assert_eq!(service.try_resolve("dave").await, Ok(LocationInfo::default()));
    assert_eq!(service.cache_len(), 0);

    server.set_delay(Duration::ZERO);
    let info = service.resolve("dave").await;
    assert_eq!(info.value.as_deref(), Some("Chile"));
    assert_eq!(server.hits("dave"), 2);
}

#[tokio::test]
async fn test_from_config_requires_base_url() {
    locator_test::setup();
    let result = ResolverService::from_config(&Default::default()).await;
    assert!(result.is_err());
}
