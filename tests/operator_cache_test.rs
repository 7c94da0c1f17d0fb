//! Operator cache round-trips, TTL expiry, and sweeping against a
//! real on-disk store.

mod support;

use modem_test::operator_cache::{OperatorCache, OperatorCacheConfig};
use std::time::Duration;
use support::{operator, phone};
use tempfile::TempDir;

fn config_in(dir: &TempDir, ttl: Duration) -> OperatorCacheConfig {
    OperatorCacheConfig {
        path: Some(dir.path().join("cache").to_str().unwrap().to_string()),
        ttl,
        sweep_interval: Duration::from_secs(3600),
    }
}

#[tokio::test]
async fn set_get_overwrite_delete_round_trip() {
    let dir = TempDir::new().unwrap();
    let cache = OperatorCache::open(&config_in(&dir, Duration::from_secs(3600)))
        .await
        .unwrap();
    let p = phone("74950001122");

    assert!(cache.get(&p).await.is_none());

    cache.set(&p, &operator("a", "1#")).await.unwrap();
    let entry = cache.get(&p).await.unwrap();
    assert_eq!(entry.operator_name, "a");
    assert_eq!(entry.operator_prefix, "1#");

    // a new success overwrites the previous entry
    cache.set(&p, &operator("b", "2#")).await.unwrap();
    let entry = cache.get(&p).await.unwrap();
    assert_eq!(entry.operator_name, "b");

    cache.delete(&p).await.unwrap();
    assert!(cache.get(&p).await.is_none());

    // deleting again is fine
    cache.delete(&p).await.unwrap();
    cache.close().await;
}

#[tokio::test]
async fn entries_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir, Duration::from_secs(3600));
    {
        let cache = OperatorCache::open(&config).await.unwrap();
        cache
            .set(&phone("74950001122"), &operator("a", "1#"))
            .await
            .unwrap();
        cache.close().await;
    }

    let cache = OperatorCache::open(&config).await.unwrap();
    let entry = cache.get(&phone("74950001122")).await.unwrap();
    assert_eq!(entry.operator_name, "a");
}

#[tokio::test]
async fn expired_entries_read_as_missing_and_sweep_away() {
    let dir = TempDir::new().unwrap();
    let cache = OperatorCache::open(&config_in(&dir, Duration::ZERO)).await.unwrap();
    let p = phone("74950001122");

    cache.set(&p, &operator("a", "1#")).await.unwrap();
    // zero TTL: the entry is born expired
    assert!(cache.get(&p).await.is_none());

    let removed = cache.sweep().await.unwrap();
    assert_eq!(removed, 1);
    let removed_again = cache.sweep().await.unwrap();
    assert_eq!(removed_again, 0);
}

#[tokio::test]
async fn distinct_phones_have_distinct_entries() {
    let dir = TempDir::new().unwrap();
    let cache = OperatorCache::open(&config_in(&dir, Duration::from_secs(3600)))
        .await
        .unwrap();

    cache.set(&phone("111"), &operator("a", "1#")).await.unwrap();
    cache.set(&phone("222"), &operator("b", "2#")).await.unwrap();

    assert_eq!(cache.get(&phone("111")).await.unwrap().operator_name, "a");
    assert_eq!(cache.get(&phone("222")).await.unwrap().operator_name, "b");

    cache.delete(&phone("111")).await.unwrap();
    assert!(cache.get(&phone("111")).await.is_none());
    assert!(cache.get(&phone("222")).await.is_some());
}
