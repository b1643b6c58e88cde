use gateway_billing::health::StorageType;
use gateway_billing::kv::{usage_key, KvBackend};

use crate::{connected_store, redis_service, unique_key};

#[tokio::test]
async fn test_redis_increment_and_read() {
    let service = redis_service(|_| {}).await;
    let key = unique_key("increment");

    assert_eq!(service.usage().get_usage(&key).await, 0);
    assert!(service.usage().increment_usage(&key, 1000).await);
    assert!(service.usage().increment_usage(&key, 500).await);
    assert_eq!(service.usage().get_usage(&key).await, 1500);

    let detailed = service.usage().get_detailed_usage(&key).await;
    assert_eq!(detailed.used_tokens, 1500);
    assert_eq!(detailed.storage_type, StorageType::Backend);
    assert!(detailed.last_updated.is_some());

    assert!(service.usage().reset_usage(&key).await);
    assert_eq!(service.usage().get_usage(&key).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redis_concurrent_increments() {
    let service = std::sync::Arc::new(redis_service(|_| {}).await);
    let key = unique_key("concurrent");

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let service = service.clone();
            let key = key.clone();
            tokio::spawn(async move { service.usage().increment_usage(&key, 10).await })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    assert_eq!(service.usage().get_usage(&key).await, 1000);
}

#[tokio::test]
async fn test_redis_stats_include_new_keys() {
    let service = redis_service(|_| {}).await;
    let key = unique_key("stats");
    service.usage().increment_usage(&key, 77).await;

    let stats = service.usage().get_all_usage_stats().await;
    assert_eq!(stats.storage_type, StorageType::Backend);
    assert!(stats.total_keys >= 1);
    assert!(stats.total_tokens >= 77);
}

#[tokio::test]
async fn test_redis_scan_sees_written_counters() {
    let store = connected_store().await;
    let key = unique_key("scan");
    store.atomic_increment(&usage_key(&key), 3).await.unwrap();

    let keys = store.scan_prefix(&usage_key("e2e-scan-")).await.unwrap();
    assert!(keys.contains(&usage_key(&key)));
    assert!(store.delete(&usage_key(&key)).await.unwrap());
}

#[tokio::test]
async fn test_redis_corrupted_counter_does_not_degrade_backend() {
    let service = redis_service(|_| {}).await;
    let store = connected_store().await;
    let key = unique_key("corrupted");
    store.set(&usage_key(&key), "not-a-number").await.unwrap();

    assert!(!service.usage().increment_usage(&key, 1).await);
    let report = service.health_check().await;
    assert!(report.backend_connected);
    assert_eq!(report.consecutive_failures, 0);

    let other = unique_key("healthy-neighbour");
    assert!(service.usage().increment_usage(&other, 5).await);
    let detailed = service.usage().get_detailed_usage(&other).await;
    assert_eq!(detailed.storage_type, StorageType::Backend);

    store.delete(&usage_key(&key)).await.unwrap();
}
