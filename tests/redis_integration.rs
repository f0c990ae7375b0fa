//! Integration tests for the Redis-backed coordination state: response-code
//! time series, request slot pools and the response cache.
//!
//! These tests require Docker (via testcontainers) and fail at container
//! startup in environments without it.
//!
//! Run with: `cargo test --test redis_integration`

mod common;

use common::{spawn_server, start_redis};
use seisfed::cache::Cache;
use seisfed::limit::PoolManager;
use seisfed::stats::{ResponseCodeStats, ResponseCodeTimeSeries};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ENDPOINT: &str = "http://ep.example.org/fdsnws/dataselect/1/query";

#[tokio::test]
async fn test_time_series_window_is_enforced() {
    let (url, _redis) = start_redis().await;
    let client = redis::Client::open(url.as_str()).unwrap();
    let series = ResponseCodeTimeSeries::new(client, "test:window".to_string(), 3600, 5);

    for _ in 0..12 {
        series.append(200).await.unwrap();
    }
    assert_eq!(series.len().await.unwrap(), 5);
    series.clear().await.unwrap();
}

#[tokio::test]
async fn test_time_series_concurrent_appends_respect_window() {
    let (url, _redis) = start_redis().await;
    let client = redis::Client::open(url.as_str()).unwrap();
    let series = Arc::new(ResponseCodeTimeSeries::new(
        client,
        "test:concurrent".to_string(),
        3600,
        10,
    ));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let series = series.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..10 {
                series.append(200).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(series.len().await.unwrap(), 10);
}

#[tokio::test]
async fn test_time_series_ttl_hides_old_members() {
    let (url, _redis) = start_redis().await;
    let client = redis::Client::open(url.as_str()).unwrap();
    // 1-second TTL.
    let series = ResponseCodeTimeSeries::new(client, "test:ttl".to_string(), 1, 100);

    series.append(503).await.unwrap();
    assert_eq!(series.members().await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(series.members().await.unwrap().is_empty());
    assert_eq!(series.error_ratio().await.unwrap(), 0.0);

    // gc removes them from the store as well.
    series.gc().await.unwrap();
    assert_eq!(series.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_error_ratio_over_live_window() {
    let (url, _redis) = start_redis().await;
    let client = redis::Client::open(url.as_str()).unwrap();
    let stats = ResponseCodeStats::new(client, 3600, 100);

    for _ in 0..8 {
        stats.add(ENDPOINT, 503).await.unwrap();
    }
    for _ in 0..2 {
        stats.add(ENDPOINT, 200).await.unwrap();
    }

    let ratio = stats.error_ratio(ENDPOINT).await.unwrap();
    assert!((ratio - 0.8).abs() < 1e-9);
    stats.clear(ENDPOINT).await.unwrap();
}

#[tokio::test]
async fn test_slot_pool_unlimited_without_alimit_service() {
    let (url, _redis) = start_redis().await;
    let client = redis::Client::open(url.as_str()).unwrap();
    let pools = PoolManager::new(client, reqwest::Client::new(), None);

    let pool = pools.pool_for(ENDPOINT).await.unwrap();
    assert_eq!(pool.maxsize(), -1);
    assert!(pool.acquire(Duration::from_millis(10)).await.unwrap());
    pool.release().await.unwrap();
}

#[tokio::test]
async fn test_slot_pool_serializes_contenders() {
    let (url, _redis) = start_redis().await;
    let client = redis::Client::open(url.as_str()).unwrap();

    // Access-limit service granting a single slot to our endpoint.
    let alimit = spawn_server(move |req| {
        assert_eq!(req.query, "service=dataselect");
        (200, format!("{} 1\n", ENDPOINT).into_bytes())
    })
    .await;

    let pools = Arc::new(PoolManager::new(
        client,
        reqwest::Client::new(),
        Some(alimit),
    ));
    let pool = pools.pool_for(ENDPOINT).await.unwrap();
    assert_eq!(pool.maxsize(), 1);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let pools = pools.clone();
        let running = running.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            let pool = pools.pool_for(ENDPOINT).await.unwrap();
            let acquired = pool.acquire(Duration::from_secs(10)).await.unwrap();
            assert!(acquired, "acquire timed out under generous deadline");

            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            running.fetch_sub(1, Ordering::SeqCst);

            pool.release().await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // The single slot serialized the call windows.
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_slot_pool_acquire_times_out() {
    let (url, _redis) = start_redis().await;
    let client = redis::Client::open(url.as_str()).unwrap();

    let alimit = spawn_server(move |_| (200, format!("{} 1\n", ENDPOINT).into_bytes())).await;
    let pools = PoolManager::new(client, reqwest::Client::new(), Some(alimit));
    let pool = pools.pool_for(ENDPOINT).await.unwrap();

    assert!(pool.acquire(Duration::from_millis(10)).await.unwrap());
    // The slot is taken; a second acquire must time out.
    assert!(!pool.acquire(Duration::from_millis(200)).await.unwrap());
    pool.release().await.unwrap();
}

#[tokio::test]
async fn test_missing_alimit_entry_defaults_to_unlimited() {
    let (url, _redis) = start_redis().await;
    let client = redis::Client::open(url.as_str()).unwrap();

    let alimit =
        spawn_server(|_| (200, b"http://other/fdsnws/dataselect/1/query 3\n".to_vec())).await;
    let pools = PoolManager::new(client, reqwest::Client::new(), Some(alimit));
    let pool = pools.pool_for(ENDPOINT).await.unwrap();
    assert_eq!(pool.maxsize(), -1);
}

#[tokio::test]
async fn test_redis_cache_roundtrip_and_expiry() {
    let (url, _redis) = start_redis().await;
    let client = redis::Client::open(url.as_str()).unwrap();
    let cache = Cache::redis(client, "cache:".to_string(), 300);

    assert!(cache.get("abcdef").await.is_none());

    cache.set("abcdef", bytes::Bytes::from("payload"), 1).await;
    assert_eq!(&cache.get("abcdef").await.unwrap()[..], b"payload");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(cache.get("abcdef").await.is_none());
}
