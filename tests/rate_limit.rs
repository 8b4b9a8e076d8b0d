mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use semantic_gateway::error::GatewayError;
use semantic_gateway::services::{BucketConfig, RateLimiter, RouteClass, ServiceSettings};
use semantic_gateway::storage::{MemoryStore, SharedStore, SqliteStore};

fn tight_limits() -> ServiceSettings {
    ServiceSettings {
        query_bucket: BucketConfig::new(2.0, 0.5),
        metadata_bucket: BucketConfig::new(1.0, 0.5),
        ..ServiceSettings::default()
    }
}

#[tokio::test]
async fn test_burst_then_denied_with_retry_after() {
    let adapter = ScriptedAdapter::new(Duration::ZERO);
    let service = build_service(adapter.clone(), Arc::new(MemoryStore::new()), tight_limits()).await;
    let tenant = analyst("acme");

    service.run_query(&revenue_by_region(), &tenant).await.unwrap();
    service.run_query(&revenue_by_region(), &tenant).await.unwrap();
    let err = service.run_query(&revenue_by_region(), &tenant).await.unwrap_err();

    let retry_after = err.retry_after().expect("retry hint");
    assert!(retry_after > Duration::ZERO && retry_after <= Duration::from_secs(2));
    assert_eq!(err.code(), "RATE_LIMITED");
    // Denied requests never reach the source
    assert_eq!(adapter.calls(), 1);
}

#[tokio::test]
async fn test_buckets_are_per_api_key() {
    let adapter = ScriptedAdapter::new(Duration::ZERO);
    let service = build_service(adapter, Arc::new(MemoryStore::new()), tight_limits()).await;

    for _ in 0..2 {
        service.run_query(&revenue_by_region(), &analyst("acme")).await.unwrap();
    }
    assert!(service.run_query(&revenue_by_region(), &analyst("acme")).await.is_err());
    assert!(service.run_query(&revenue_by_region(), &analyst("globex")).await.is_ok());
}

#[tokio::test]
async fn test_route_classes_have_separate_buckets() {
    let adapter = ScriptedAdapter::new(Duration::ZERO);
    let service = build_service(adapter, Arc::new(MemoryStore::new()), tight_limits()).await;
    let tenant = analyst("acme");

    service.list_datasets(&tenant).await.unwrap();
    let err = service.explain(&revenue_by_region(), &tenant).await.unwrap_err();
    assert!(matches!(err, GatewayError::RateLimited { .. }));

    // Query bucket is untouched by metadata calls
    service.run_query(&revenue_by_region(), &tenant).await.unwrap();
}

#[tokio::test]
async fn test_tokens_refill_over_time() {
    let adapter = ScriptedAdapter::new(Duration::ZERO);
    let settings = ServiceSettings {
        query_bucket: BucketConfig::new(1.0, 10.0),
        ..ServiceSettings::default()
    };
    let service = build_service(adapter, Arc::new(MemoryStore::new()), settings).await;
    let tenant = analyst("acme");

    service.run_query(&revenue_by_region(), &tenant).await.unwrap();
    assert!(service.run_query(&revenue_by_region(), &tenant).await.is_err());

    tokio::time::sleep(Duration::from_millis(150)).await;
    service.run_query(&revenue_by_region(), &tenant).await.unwrap();
}

async fn admit_concurrently(store: Arc<dyn SharedStore>, requests: usize) -> (usize, usize) {
    let limiter = Arc::new(RateLimiter::new(
        store,
        BucketConfig::new(10_000.0, 1.0),
        BucketConfig::new(10_000.0, 1.0),
    ));
    let mut handles = Vec::new();
    for _ in 0..requests {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move { limiter.admit("k", RouteClass::Query).await }));
    }

    let (mut allowed, mut failed) = (0, 0);
    for handle in handles {
        match handle.await.unwrap() {
            Ok(admission) if admission.is_allowed() => allowed += 1,
            Ok(_) => {}
            Err(_) => failed += 1,
        }
    }
    (allowed, failed)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_burst_within_capacity_is_admitted_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("store.db")).await.unwrap();

    let (allowed, failed) = admit_concurrently(Arc::new(store), 200).await;
    assert_eq!(failed, 0);
    assert_eq!(allowed, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_burst_within_capacity_is_admitted_in_memory() {
    let (allowed, failed) = admit_concurrently(Arc::new(MemoryStore::new()), 200).await;
    assert_eq!(failed, 0);
    assert_eq!(allowed, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_processes_sharing_a_file_never_overspend() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    let config = BucketConfig::new(50.0, 0.001);
    let limiters: Vec<Arc<RateLimiter>> = vec![
        Arc::new(RateLimiter::new(Arc::new(SqliteStore::new(&path).await.unwrap()), config, config)),
        Arc::new(RateLimiter::new(Arc::new(SqliteStore::new(&path).await.unwrap()), config, config)),
    ];

    let mut handles = Vec::new();
    for i in 0..120 {
        let limiter = limiters[i % 2].clone();
        handles.push(tokio::spawn(async move {
            limiter.admit_at("k", RouteClass::Query, 1_000).await.unwrap().is_allowed()
        }));
    }
    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 50);
}
