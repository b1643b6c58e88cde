use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use crate::error::{Error, ErrorDetails};
use crate::health::{BackendHealth, BackendHealthMonitor, StorageType};
use crate::kv::rate_limit_key;
use crate::mask::mask_api_key;
use crate::rate_limit::{RateLimitConfig, RateLimitDecision, RateLimitStatus, RateLimiterMetrics};
use crate::tariff::{Tariff, TariffRegistry};

/// Returns 0 if system time is before UNIX_EPOCH.
fn get_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Fixed-window request limiter.
///
/// Each key owns one counter at `rate_limit:{key}` that expires
/// `window_seconds` after the first request of the window. Admission is a
/// single increment-with-expiry against the active store followed by a
/// comparison of the returned count, so two concurrent callers can never both
/// be admitted past the limit. Denied requests still count toward the window.
pub struct RateLimiter {
    health: Arc<BackendHealthMonitor>,
    tariffs: Arc<TariffRegistry>,
    config: RateLimitConfig,
    metrics: RateLimiterMetrics,
}

impl RateLimiter {
    pub fn new(
        health: Arc<BackendHealthMonitor>,
        tariffs: Arc<TariffRegistry>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            health,
            tariffs,
            config,
            metrics: RateLimiterMetrics::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn metrics(&self) -> &RateLimiterMetrics {
        &self.metrics
    }

    fn build_status(
        api_key: &str,
        tariff: &Tariff,
        current_count: u64,
        reset_after: u64,
        storage_type: StorageType,
    ) -> RateLimitStatus {
        let limit = tariff.max_requests_per_window;
        let remaining = u64::from(limit).saturating_sub(current_count);
        RateLimitStatus {
            api_key: mask_api_key(api_key),
            current_count,
            limit,
            // Bounded by `limit`, which is a u32
            remaining: u32::try_from(remaining).unwrap_or(limit),
            window_seconds: tariff.window_seconds,
            reset_after,
            reset_at: get_unix_timestamp() + reset_after,
            retry_after: None,
            storage_type,
        }
    }

    /// Seconds left in the key's window, or the full window if unknown.
    async fn window_reset_after(&self, counter_key: &str, window_seconds: u64) -> u64 {
        match self
            .health
            .execute("ttl", |store| store.ttl(counter_key))
            .await
        {
            Ok(served) => served.value.unwrap_or(window_seconds),
            Err(e) => {
                debug!("Failed to read rate limit window TTL: {e}");
                window_seconds
            }
        }
    }

    /// Count one request for `api_key` and decide whether it is admitted.
    ///
    /// If neither store can record the request it is admitted.
    pub async fn check_rate_limit(&self, api_key: &str) -> RateLimitDecision {
        let tariff = self.tariffs.get_tariff(api_key);
        if !self.config.enabled {
            self.metrics.record_allowed();
            return RateLimitDecision::Allow(Self::build_status(
                api_key,
                &tariff,
                0,
                tariff.window_seconds,
                self.health.storage_type(),
            ));
        }

        let counter = rate_limit_key(api_key);
        let counter_key = counter.as_str();
        let window_seconds = tariff.window_seconds;
        let served = match self
            .health
            .execute("check_rate_limit", |store| {
                store.increment_with_expiry(counter_key, 1, window_seconds)
            })
            .await
        {
            Ok(served) => served,
            Err(e) => {
                self.metrics.record_store_error();
                self.metrics.record_allowed();
                error!(
                    api_key = %mask_api_key(api_key),
                    "Failed to count request, admitting it: {e}"
                );
                return RateLimitDecision::Allow(Self::build_status(
                    api_key,
                    &tariff,
                    0,
                    window_seconds,
                    self.health.storage_type(),
                ));
            }
        };

        if served.storage == StorageType::Fallback {
            self.metrics.record_fallback_decision();
        }
        let current_count = u64::try_from(served.value).unwrap_or(0);
        let reset_after = self.window_reset_after(counter_key, window_seconds).await;
        let status = Self::build_status(api_key, &tariff, current_count, reset_after, served.storage);

        if current_count > u64::from(tariff.max_requests_per_window) {
            self.metrics.record_denied();
            warn!(
                api_key = %status.api_key,
                current_count,
                limit = status.limit,
                "Rate limit exceeded"
            );
            RateLimitDecision::Deny(RateLimitStatus {
                remaining: 0,
                retry_after: Some(window_seconds),
                ..status
            })
        } else {
            self.metrics.record_allowed();
            debug!(
                api_key = %status.api_key,
                current_count,
                limit = status.limit,
                "Rate limit check passed"
            );
            RateLimitDecision::Allow(status)
        }
    }

    /// Drop the key's window so its next request starts a new one. A reset
    /// served by the backend also drops any fallback window of the key.
    pub async fn reset_rate_limit(&self, api_key: &str) -> bool {
        let counter = rate_limit_key(api_key);
        let counter_key = counter.as_str();
        match self
            .health
            .execute("reset_rate_limit", |store| store.delete(counter_key))
            .await
        {
            Ok(served) => {
                if served.storage == StorageType::Backend {
                    self.health.clear_fallback(&[counter_key]).await;
                }
                info!(
                    api_key = %mask_api_key(api_key),
                    storage_type = ?served.storage,
                    "Rate limit reset"
                );
                true
            }
            Err(e) => {
                self.metrics.record_store_error();
                error!(api_key = %mask_api_key(api_key), "Failed to reset rate limit: {e}");
                false
            }
        }
    }

    /// Current window state without counting a request.
    pub async fn get_rate_limit_info(&self, api_key: &str) -> RateLimitStatus {
        let tariff = self.tariffs.get_tariff(api_key);
        let counter = rate_limit_key(api_key);
        let counter_key = counter.as_str();
        let window_seconds = tariff.window_seconds;

        let result = self
            .health
            .execute("get_rate_limit_info", move |store| async move {
                let Some(raw) = store.get(counter_key).await? else {
                    return Ok((0, window_seconds));
                };
                let count = raw.trim().parse::<i64>().map_err(|_| {
                    Error::new(ErrorDetails::InvalidCounterValue {
                        key: counter_key.to_string(),
                        value: raw.clone(),
                    })
                })?;
                let reset_after = store.ttl(counter_key).await?.unwrap_or(window_seconds);
                Ok::<_, Error>((u64::try_from(count).unwrap_or(0), reset_after))
            })
            .await;

        match result {
            Ok(served) => {
                let (current_count, reset_after) = served.value;
                Self::build_status(api_key, &tariff, current_count, reset_after, served.storage)
            }
            Err(e) => {
                self.metrics.record_store_error();
                warn!(
                    api_key = %mask_api_key(api_key),
                    "Failed to read rate limit window, reporting an empty one: {e}"
                );
                Self::build_status(
                    api_key,
                    &tariff,
                    0,
                    window_seconds,
                    self.health.storage_type(),
                )
            }
        }
    }

    pub fn get_redis_health(&self) -> BackendHealth {
        self.health.backend_health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::BackendConnection;
    use crate::kv::MemoryStore;
    use crate::tariff::TariffPlan;
    use crate::testing::FaultyStore;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn registry() -> Arc<TariffRegistry> {
        Arc::new(
            TariffRegistry::new(Tariff {
                name: "Default".to_string(),
                max_tokens: 50_000,
                max_requests_per_window: 30,
                window_seconds: 60,
                description: "Default tariff".to_string(),
            })
            .unwrap(),
        )
    }

    fn memory_limiter(config: RateLimitConfig) -> RateLimiter {
        let health = BackendHealthMonitor::new(
            None,
            Arc::new(MemoryStore::new()),
            Duration::from_millis(50),
            Duration::from_secs(5),
        );
        RateLimiter::new(Arc::new(health), registry(), config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_thirty_requests_admitted_then_denied() {
        let limiter = memory_limiter(RateLimitConfig::default());

        for expected_remaining in (0..30).rev() {
            let decision = limiter.check_rate_limit("k").await;
            assert!(decision.is_allowed());
            assert_eq!(decision.status().remaining, expected_remaining);
            assert_eq!(decision.status().limit, 30);
            assert_eq!(decision.status().retry_after, None);
        }

        let decision = limiter.check_rate_limit("k").await;
        assert!(!decision.is_allowed());
        let status = decision.into_status();
        assert_eq!(status.remaining, 0);
        assert_eq!(status.current_count, 31);
        assert_eq!(status.retry_after, Some(60));

        // Denied requests keep counting.
        limiter.check_rate_limit("k").await;
        assert_eq!(limiter.get_rate_limit_info("k").await.current_count, 32);
        assert_eq!(limiter.metrics().denied.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_window_after_expiry() {
        let limiter = memory_limiter(RateLimitConfig::default());
        for _ in 0..31 {
            limiter.check_rate_limit("k").await;
        }

        tokio::time::advance(Duration::from_secs(59)).await;
        let info = limiter.get_rate_limit_info("k").await;
        assert_eq!(info.reset_after, 1);
        assert!(!limiter.check_rate_limit("k").await.is_allowed());

        tokio::time::advance(Duration::from_secs(1)).await;
        let decision = limiter.check_rate_limit("k").await;
        assert!(decision.is_allowed());
        assert_eq!(decision.status().current_count, 1);
        assert_eq!(decision.status().reset_after, 60);
    }

    #[tokio::test]
    async fn test_info_does_not_increment() {
        let limiter = memory_limiter(RateLimitConfig::default());

        let info = limiter.get_rate_limit_info("k").await;
        assert_eq!(info.current_count, 0);
        assert_eq!(info.remaining, 30);
        assert_eq!(info.retry_after, None);

        limiter.check_rate_limit("k").await;
        limiter.check_rate_limit("k").await;
        let info = limiter.get_rate_limit_info("k").await;
        assert_eq!(info.current_count, 2);
        assert_eq!(info.remaining, 28);
        assert_eq!(limiter.get_rate_limit_info("k").await.current_count, 2);
    }

    #[tokio::test]
    async fn test_last_admitted_request_has_no_retry_after() {
        let limiter = memory_limiter(RateLimitConfig::default());
        for _ in 0..29 {
            limiter.check_rate_limit("k").await;
        }

        let decision = limiter.check_rate_limit("k").await;
        assert!(decision.is_allowed());
        assert_eq!(decision.status().remaining, 0);
        let headers = decision.status().to_header_map();
        assert_eq!(headers["X-RateLimit-Remaining"], "0");
        assert!(headers.get("Retry-After").is_none());

        let info = limiter.get_rate_limit_info("k").await;
        assert_eq!(info.current_count, 30);
        assert_eq!(info.retry_after, None);
    }

    #[tokio::test]
    async fn test_reset_during_health_drops_window_from_earlier_outage() {
        let backend = Arc::new(FaultyStore::new());
        let health = Arc::new(BackendHealthMonitor::new(
            Some(backend.clone()),
            Arc::new(MemoryStore::new()),
            Duration::from_millis(50),
            Duration::from_secs(5),
        ));
        health.initialize().await;
        let limiter = RateLimiter::new(Arc::clone(&health), registry(), RateLimitConfig::default());

        backend.set_available(false);
        for _ in 0..31 {
            limiter.check_rate_limit("k").await;
        }
        backend.set_available(true);
        assert!(health.probe_now().await);
        assert!(limiter.reset_rate_limit("k").await);

        backend.set_available(false);
        let decision = limiter.check_rate_limit("k").await;
        assert!(decision.is_allowed());
        assert_eq!(decision.status().storage_type, StorageType::Fallback);
        assert_eq!(decision.status().current_count, 1);
    }

    #[tokio::test]
    async fn test_reset_unthrottles_immediately() {
        let limiter = memory_limiter(RateLimitConfig::default());
        for _ in 0..31 {
            limiter.check_rate_limit("k").await;
        }
        assert!(!limiter.check_rate_limit("k").await.is_allowed());

        assert!(limiter.reset_rate_limit("k").await);
        let decision = limiter.check_rate_limit("k").await;
        assert!(decision.is_allowed());
        assert_eq!(decision.status().current_count, 1);
        // Resetting a key without a window succeeds too.
        assert!(limiter.reset_rate_limit("never-seen").await);
    }

    #[tokio::test]
    async fn test_keys_and_tariffs_are_isolated() {
        let limiter = memory_limiter(RateLimitConfig::default());
        limiter
            .tariffs
            .apply_tariff_plan("premium-key", TariffPlan::Premium)
            .unwrap();

        for _ in 0..31 {
            limiter.check_rate_limit("a").await;
        }
        assert!(!limiter.check_rate_limit("a").await.is_allowed());

        let decision = limiter.check_rate_limit("b").await;
        assert!(decision.is_allowed());
        assert_eq!(decision.status().current_count, 1);

        for _ in 0..100 {
            limiter.check_rate_limit("premium-key").await;
        }
        let decision = limiter.check_rate_limit("premium-key").await;
        assert!(decision.is_allowed());
        assert_eq!(decision.status().limit, 120);
        assert_eq!(decision.status().remaining, 19);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_admit_past_the_limit() {
        let limiter = Arc::new(memory_limiter(RateLimitConfig::default()));
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.check_rate_limit("k").await.is_allowed() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 30);
    }

    #[tokio::test]
    async fn test_disabled_limiter_admits_without_counting() {
        let limiter = memory_limiter(RateLimitConfig {
            enabled: false,
            ..Default::default()
        });
        for _ in 0..50 {
            assert!(limiter.check_rate_limit("k").await.is_allowed());
        }
        assert_eq!(limiter.get_rate_limit_info("k").await.current_count, 0);
    }

    #[tokio::test]
    async fn test_backend_outage_keeps_throttling_on_fallback() {
        let backend = Arc::new(FaultyStore::new());
        let health = BackendHealthMonitor::new(
            Some(backend.clone()),
            Arc::new(MemoryStore::new()),
            Duration::from_millis(50),
            Duration::from_secs(5),
        );
        health.initialize().await;
        let limiter = RateLimiter::new(Arc::new(health), registry(), RateLimitConfig::default());
        assert_eq!(limiter.get_redis_health().status, BackendConnection::Connected);

        backend.set_available(false);
        let decision = limiter.check_rate_limit("k").await;
        assert!(decision.is_allowed());
        assert_eq!(decision.status().storage_type, StorageType::Fallback);
        assert_eq!(decision.status().current_count, 1);
        assert_eq!(
            limiter.get_redis_health().status,
            BackendConnection::Disconnected
        );
        assert_eq!(limiter.get_redis_health().fallback, Some("memory_storage"));
        assert!(limiter.metrics().fallback_decisions.load(Ordering::Relaxed) >= 1);
    }

    #[tokio::test]
    async fn test_unrecoverable_store_fails_open() {
        let fallback = Arc::new(FaultyStore::new());
        fallback.set_available(false);
        let health = BackendHealthMonitor::new(
            None,
            fallback,
            Duration::from_millis(50),
            Duration::from_secs(5),
        );
        let limiter = RateLimiter::new(Arc::new(health), registry(), RateLimitConfig::default());

        assert!(limiter.check_rate_limit("k").await.is_allowed());
        assert!(!limiter.reset_rate_limit("k").await);
        assert_eq!(limiter.metrics().store_errors.load(Ordering::Relaxed), 2);
        assert_eq!(
            limiter.get_redis_health().status,
            BackendConnection::NotConfigured
        );
    }
}
