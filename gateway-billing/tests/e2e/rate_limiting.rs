use gateway_billing::health::BackendConnection;
use gateway_billing::kv::{rate_limit_key, KvBackend};
use std::time::Duration;

use crate::{connected_store, redis_service, unique_key};

#[tokio::test]
async fn test_redis_window_admits_limit_then_denies() {
    let service = redis_service(|config| {
        config.rate_limit.requests_per_window = 5;
        config.rate_limit.window_seconds = 30;
    })
    .await;
    let key = unique_key("window");
    let limiter = service.rate_limiter();

    for remaining in (0..5).rev() {
        let decision = limiter.check_rate_limit(&key).await;
        assert!(decision.is_allowed());
        assert_eq!(decision.status().remaining, remaining);
    }
    let denied = limiter.check_rate_limit(&key).await;
    assert!(!denied.is_allowed());
    assert_eq!(denied.status().retry_after, Some(30));
    assert!(denied.status().reset_after <= 30);

    assert!(limiter.reset_rate_limit(&key).await);
    assert_eq!(limiter.get_rate_limit_info(&key).await.current_count, 0);
    assert_eq!(limiter.get_redis_health().status, BackendConnection::Connected);
}

#[tokio::test]
async fn test_redis_window_expires() {
    let service = redis_service(|config| {
        config.rate_limit.requests_per_window = 1;
        config.rate_limit.window_seconds = 1;
    })
    .await;
    let key = unique_key("expiry");
    let limiter = service.rate_limiter();

    assert!(limiter.check_rate_limit(&key).await.is_allowed());
    assert!(!limiter.check_rate_limit(&key).await.is_allowed());

    tokio::time::sleep(Duration::from_millis(2100)).await;
    let decision = limiter.check_rate_limit(&key).await;
    assert!(decision.is_allowed());
    assert_eq!(decision.status().current_count, 1);
}

#[tokio::test]
async fn test_redis_increment_with_expiry_keeps_first_deadline() {
    let store = connected_store().await;
    let key = rate_limit_key(&unique_key("script"));

    assert_eq!(store.increment_with_expiry(&key, 1, 60).await.unwrap(), 1);
    assert_eq!(store.increment_with_expiry(&key, 1, 600).await.unwrap(), 2);
    let ttl = store.ttl(&key).await.unwrap().unwrap();
    assert!(ttl <= 60, "ttl was extended to {ttl}");
    assert!(store.delete(&key).await.unwrap());
}
