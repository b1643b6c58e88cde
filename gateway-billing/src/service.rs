use secrecy::ExposeSecret;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::BillingConfig;
use crate::error::Error;
use crate::health::{BackendHealthMonitor, HealthReport};
use crate::kv::{KvBackend, MemoryStore, RedisStore};
use crate::mask::mask_api_key;
use crate::rate_limit::RateLimiter;
use crate::tariff::{Tariff, TariffRegistry};
use crate::usage::UsageTracker;

/// A key's consumption measured against its tariff.
#[derive(Clone, Debug, Serialize)]
pub struct TariffUsage {
    pub api_key: String,
    pub tariff: Tariff,
    pub used_tokens: u64,
    pub remaining_tokens: u64,
    /// Percent of `max_tokens` used, rounded to two decimals
    pub usage_percentage: f64,
}

fn usage_percentage(used_tokens: u64, max_tokens: u64) -> f64 {
    if max_tokens == 0 {
        return 0.0;
    }
    let percentage = used_tokens as f64 / max_tokens as f64 * 100.0;
    (percentage * 100.0).round() / 100.0
}

/// The billing core, built once at startup and shared by `Arc`.
pub struct BillingService {
    health: Arc<BackendHealthMonitor>,
    tariffs: Arc<TariffRegistry>,
    usage: UsageTracker,
    rate_limiter: RateLimiter,
}

impl BillingService {
    /// Build every component from `config` and make the first connection
    /// attempt. An unreachable backend yields a degraded service, not an
    /// error; only invalid configuration fails.
    pub async fn from_config(config: &BillingConfig) -> Result<Self, Error> {
        config.validate()?;

        let backend: Option<Arc<dyn KvBackend>> = if config.backend.enabled {
            let url = config.backend.connection_url();
            let store = RedisStore::new(url.expose_secret(), config.backend.timeout())?;
            Some(Arc::new(store))
        } else {
            info!("Counter backend disabled by configuration");
            None
        };

        Self::with_stores(backend, Arc::new(MemoryStore::new()), config).await
    }

    /// Build the service over explicit stores.
    pub async fn with_stores(
        backend: Option<Arc<dyn KvBackend>>,
        fallback: Arc<dyn KvBackend>,
        config: &BillingConfig,
    ) -> Result<Self, Error> {
        let tariffs = Arc::new(TariffRegistry::new(config.default_tariff())?);
        let loaded = tariffs.load_tariffs(config.tariffs.clone())?;
        if loaded > 0 {
            info!(count = loaded, "Loaded tariff overrides from configuration");
        }

        let health = Arc::new(BackendHealthMonitor::new(
            backend,
            fallback,
            config.backend.timeout(),
            config.backend.probe_interval(),
        ));
        let report = health.initialize().await;
        if report.backend_configured && !report.backend_connected {
            warn!("Billing service starting in degraded mode");
        }

        let usage = UsageTracker::new(Arc::clone(&health), Arc::clone(&tariffs));
        let rate_limiter = RateLimiter::new(
            Arc::clone(&health),
            Arc::clone(&tariffs),
            config.rate_limit.clone(),
        );

        Ok(Self {
            health,
            tariffs,
            usage,
            rate_limiter,
        })
    }

    /// Start the background health probe.
    pub async fn start(&self) {
        self.health.spawn_probe().await;
    }

    pub async fn shutdown(&self) {
        self.health.stop_probe().await;
        info!("Billing service stopped");
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn tariffs(&self) -> &TariffRegistry {
        &self.tariffs
    }

    pub fn health(&self) -> &BackendHealthMonitor {
        &self.health
    }

    pub async fn health_check(&self) -> HealthReport {
        self.health.health_check().await
    }

    pub async fn tariff_usage(&self, api_key: &str) -> TariffUsage {
        let tariff = self.tariffs.get_tariff(api_key).as_ref().clone();
        let used_tokens = self.usage.get_usage(api_key).await;
        TariffUsage {
            api_key: mask_api_key(api_key),
            remaining_tokens: tariff.max_tokens.saturating_sub(used_tokens),
            usage_percentage: usage_percentage(used_tokens, tariff.max_tokens),
            used_tokens,
            tariff,
        }
    }
}
