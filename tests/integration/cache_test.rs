//! Expiring cache contract tests
//!
//! The same scenarios run against the in-memory backend and, when a local
//! redis is available (`cargo test -- --ignored`), against redis.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use trustgate::cache::{CacheError, ExpiringCache, MemoryCache, RedisCache, RedisOptions};

async fn values_round_trip(cache: &dyn ExpiringCache, prefix: &str) {
    let key = format!("{prefix}:plain");
    cache.delete(&key).await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), None, "missing key is a miss, not an error");

    cache
        .set(&key, Bytes::from_static(b"hello"), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), Some(Bytes::from_static(b"hello")));
    assert!(cache.exists(&key).await.unwrap());

    cache.delete(&key).await.unwrap();
    assert!(!cache.exists(&key).await.unwrap());
}

async fn values_expire(cache: &dyn ExpiringCache, prefix: &str) {
    let key = format!("{prefix}:short");
    cache
        .set(&key, Bytes::from_static(b"v"), Some(Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(cache.exists(&key).await.unwrap());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(cache.get(&key).await.unwrap(), None);
    assert!(!cache.exists(&key).await.unwrap());
}

async fn hash_buckets(cache: &dyn ExpiringCache, prefix: &str) {
    let bucket = format!("{prefix}:10.0.0.1");
    cache.delete(&bucket).await.unwrap();

    cache
        .hash_set_with_expiry(&bucket, "agentA", Bytes::from_static(b"A"), Duration::from_secs(60))
        .await
        .unwrap();
    cache
        .hash_set_with_expiry(&bucket, "agentB", Bytes::from_static(b"B"), Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(
        cache.hash_get(&bucket, "agentA").await.unwrap(),
        Some(Bytes::from_static(b"A"))
    );
    assert_eq!(
        cache.hash_get(&bucket, "agentB").await.unwrap(),
        Some(Bytes::from_static(b"B"))
    );
    assert_eq!(cache.hash_get(&bucket, "agentC").await.unwrap(), None);
    assert_eq!(cache.hash_get(&format!("{prefix}:nobody"), "agentA").await.unwrap(), None);

    cache.delete(&bucket).await.unwrap();
}

async fn counters(cache: &dyn ExpiringCache, prefix: &str) {
    let key = format!("{prefix}:score");
    cache
        .set(&key, Bytes::from_static(b"100"), None)
        .await
        .unwrap();
    assert_eq!(cache.decr_by(&key, 20).await.unwrap(), 80);
    assert_eq!(cache.decr_by(&key, 20).await.unwrap(), 60);
    assert_eq!(cache.get(&key).await.unwrap(), Some(Bytes::from_static(b"60")));

    cache
        .set(&key, Bytes::from_static(b"abc"), None)
        .await
        .unwrap();
    assert!(matches!(
        cache.decr_by(&key, 1).await,
        Err(CacheError::NotAnInteger(_))
    ));
    cache.delete(&key).await.unwrap();
}

#[tokio::test]
async fn test_memory_backend_contract() {
    let cache: Arc<dyn ExpiringCache> = Arc::new(MemoryCache::new(1_000));
    cache.ping().await.unwrap();
    values_round_trip(cache.as_ref(), "mem").await;
    values_expire(cache.as_ref(), "mem").await;
    hash_buckets(cache.as_ref(), "mem").await;
    counters(cache.as_ref(), "mem").await;
}

#[tokio::test]
async fn test_memory_backend_concurrent_decrements() {
    let cache = Arc::new(MemoryCache::new(1_000));
    cache
        .set("score", Bytes::from_static(b"1000"), None)
        .await
        .unwrap();

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.decr_by("score", 10).await.unwrap() })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(cache.get("score").await.unwrap(), Some(Bytes::from_static(b"500")));
}

#[tokio::test]
async fn test_unreachable_redis_is_unavailable() {
    let cache = RedisCache::connect(&RedisOptions {
        host: "127.0.0.1:1".to_string(),
        min_idle: 0,
        connect_timeout_ms: 200,
        ..Default::default()
    })
    .unwrap();

    let err = cache.get("anything").await.unwrap_err();
    assert!(err.is_unavailable(), "unexpected error: {err}");
    assert!(cache.ping().await.is_err());
}

#[tokio::test]
#[ignore = "requires a redis server on 127.0.0.1:6379"]
async fn test_redis_backend_contract() {
    let cache: Arc<dyn ExpiringCache> =
        Arc::new(RedisCache::connect(&RedisOptions::default()).unwrap());
    cache.ping().await.unwrap();
    values_round_trip(cache.as_ref(), "trustgate-test").await;
    values_expire(cache.as_ref(), "trustgate-test").await;
    hash_buckets(cache.as_ref(), "trustgate-test").await;
    counters(cache.as_ref(), "trustgate-test").await;
}
