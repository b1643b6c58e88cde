//! End-to-end tests against a live Redis at `REDIS_URL`
//! (default `redis://127.0.0.1:6379/0`).
//!
//! Every test uses its own key prefix so runs can share one database.

mod rate_limiting;
mod usage;

use gateway_billing::kv::RedisStore;
use gateway_billing::{BillingConfig, BillingService};
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;

pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string())
}

pub fn unique_key(test: &str) -> String {
    format!("e2e-{test}-{}", unique_suffix())
}

fn unique_suffix() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:x}-{}", std::process::id())
}

pub async fn connected_store() -> Arc<RedisStore> {
    use gateway_billing::kv::KvBackend;

    let store = RedisStore::new(&redis_url(), Duration::from_secs(2)).unwrap();
    store.ping().await.unwrap();
    Arc::new(store)
}

pub async fn redis_service(configure: impl FnOnce(&mut BillingConfig)) -> BillingService {
    let mut config = BillingConfig::default();
    config.backend.url = Some(SecretString::from(redis_url()));
    config.backend.timeout_ms = 1000;
    configure(&mut config);
    let service = BillingService::from_config(&config).await.unwrap();
    assert!(
        service.health_check().await.backend_connected,
        "Redis at {} is not reachable",
        redis_url()
    );
    service
}
