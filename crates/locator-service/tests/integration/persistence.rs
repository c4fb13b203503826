use std::time::Duration;

use locator_service::persistence::FlushStatus;

use crate::utils::{config, setup_service};

#[tokio::test]
async fn test_state_survives_restart() {
    locator_test::setup();
    let server = locator_test::lookup_server([("alice", "France"), ("bob", "France")]);
    let dir = locator_test::tempdir();
    let config = config(&server);

    let service = setup_service(&config, dir.path()).await;
    service.resolve_many(["alice", "bob", "nobody"]).await;
    assert!(matches!(
        service.shutdown().await,
        FlushStatus::Written { .. }
    ));

    let counts = std::fs::read_to_string(dir.path().join("usage_counts.json")).unwrap();
    insta::assert_snapshot!(counts, @r#"{"France":2}"#);
    assert!(dir.path().join("resolver_cache.json").exists());

    let restored = setup_service(&config, dir.path()).await;
    assert_eq!(restored.cache_len(), 3);
    assert_eq!(restored.counts()["France"], 2);

    let info = restored.resolve("alice").await;
    assert_eq!(info.value.as_deref(), Some("France"));
    assert_eq!(server.accesses(), 3);
}

#[tokio::test]
async fn test_debounced_write() {
    locator_test::setup();
    let server = locator_test::lookup_server([("alice", "France")]);
    let dir = locator_test::tempdir();
    let mut config = config(&server);
    config.persistence.debounce = Duration::from_millis(50);

    let service = setup_service(&config, dir.path()).await;
    service.resolve("alice").await;
    assert!(!dir.path().join("resolver_cache.json").exists());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let cache = std::fs::read_to_string(dir.path().join("resolver_cache.json")).unwrap();
    assert!(cache.contains(r#""value":"France""#));
}

#[tokio::test]
async fn test_quota_guard() {
    locator_test::setup();
    let server = locator_test::lookup_server([("alice", "France")]);
    let dir = locator_test::tempdir();
    std::fs::write(dir.path().join("ballast.json"), vec![b' '; 2048]).unwrap();

    let mut config = config(&server);
    config.persistence.quota_bytes = 1024;
    let service = setup_service(&config, dir.path()).await;
    service.resolve("alice").await;

    assert_eq!(
        service.flush().await,
        FlushStatus::SkippedQuota { used: 2048 }
    );
    assert!(!dir.path().join("resolver_cache.json").exists());
}

#[tokio::test]
async fn test_clear() {
    locator_test::setup();
    let server = locator_test::lookup_server([("alice", "France")]);
    let dir = locator_test::tempdir();
    let config = config(&server);

    let service = setup_service(&config, dir.path()).await;
    service.resolve("alice").await;
    service.flush().await;
    service.clear().await;

    let restored = setup_service(&config, dir.path()).await;
    assert_eq!(restored.cache_len(), 0);
    assert!(restored.counts().is_empty());
}
