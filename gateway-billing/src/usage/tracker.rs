use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, ErrorDetails};
use crate::health::{BackendHealthMonitor, HealthReport, Served, StorageType};
use crate::kv::{usage_key, usage_updated_key, KvBackend, USAGE_KEY_PREFIX};
use crate::mask::mask_api_key;
use crate::tariff::TariffRegistry;
use crate::usage::{DetailedUsage, KeyUsage, MonthlyResetSummary, UsageStats, UsageTrackerMetrics};

/// Per-key token counters.
///
/// Every operation goes through the health monitor, so callers never see a
/// backend fault: reads degrade to zero and writes report `false` only when
/// the fallback store failed as well.
pub struct UsageTracker {
    health: Arc<BackendHealthMonitor>,
    tariffs: Arc<TariffRegistry>,
    metrics: UsageTrackerMetrics,
}

fn parse_counter(key: &str, raw: Option<String>) -> Result<u64, Error> {
    let Some(raw) = raw else {
        return Ok(0);
    };
    let value = raw.trim().parse::<i64>().map_err(|_| {
        Error::new(ErrorDetails::InvalidCounterValue {
            key: key.to_string(),
            value: raw.clone(),
        })
    })?;
    Ok(u64::try_from(value).unwrap_or(0))
}

fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|at| at.with_timezone(&Utc))
}

/// Counter and timestamp of one key, read from the same store.
async fn read_record(
    store: &dyn KvBackend,
    counter_key: &str,
    updated_key: &str,
) -> Result<(u64, Option<DateTime<Utc>>), Error> {
    let used_tokens = parse_counter(counter_key, store.get(counter_key).await?)?;
    let last_updated = parse_timestamp(store.get(updated_key).await?);
    Ok((used_tokens, last_updated))
}

impl UsageTracker {
    pub fn new(health: Arc<BackendHealthMonitor>, tariffs: Arc<TariffRegistry>) -> Self {
        Self {
            health,
            tariffs,
            metrics: UsageTrackerMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &UsageTrackerMetrics {
        &self.metrics
    }

    async fn read_usage(&self, api_key: &str) -> Result<Served<u64>, Error> {
        let counter = usage_key(api_key);
        let counter_key = counter.as_str();
        self.health
            .execute("get_usage", move |store| async move {
                let raw = store.get(counter_key).await?;
                parse_counter(counter_key, raw)
            })
            .await
    }

    /// Tokens used by `api_key`. Absent keys and unreadable counters read as 0.
    pub async fn get_usage(&self, api_key: &str) -> u64 {
        match self.read_usage(api_key).await {
            Ok(served) => served.value,
            Err(e) => {
                self.metrics.record_failed_operation();
                debug!(
                    api_key = %mask_api_key(api_key),
                    "Reading usage failed, reporting 0: {e}"
                );
                0
            }
        }
    }

    /// Add `tokens` to the key's counter and refresh its timestamp.
    ///
    /// Negative counts are rejected without touching the store. Returns
    /// `false` when the count is rejected or neither store accepted the write.
    pub async fn increment_usage(&self, api_key: &str, tokens: i64) -> bool {
        let Ok(delta) = u64::try_from(tokens) else {
            ErrorDetails::InvalidTokenCount {
                api_key: mask_api_key(api_key),
                tokens,
            }
            .log();
            self.metrics.record_rejected_increment();
            return false;
        };

        let counter = usage_key(api_key);
        let counter_key = counter.as_str();
        let total = match self
            .health
            .execute("increment_usage", |store| {
                store.atomic_increment(counter_key, tokens)
            })
            .await
        {
            Ok(served) => served,
            Err(e) => {
                self.metrics.record_failed_operation();
                error!(
                    api_key = %mask_api_key(api_key),
                    tokens,
                    "Failed to record token usage: {e}"
                );
                return false;
            }
        };

        // The counter is committed at this point. A failed timestamp write
        // leaves it as is.
        let updated = usage_updated_key(api_key);
        let updated_key = updated.as_str();
        let now = Utc::now().to_rfc3339();
        let now = now.as_str();
        if let Err(e) = self
            .health
            .execute("increment_usage", |store| store.set(updated_key, now))
            .await
        {
            warn!(
                api_key = %mask_api_key(api_key),
                "Failed to refresh usage timestamp: {e}"
            );
        }

        self.metrics.record_increment(delta);
        debug!(
            api_key = %mask_api_key(api_key),
            tokens,
            used_tokens = total.value,
            storage_type = ?total.storage,
            "Recorded token usage"
        );
        true
    }

    /// Whether `api_key` is still strictly below `max_tokens`.
    pub async fn check_limit(&self, api_key: &str, max_tokens: u64) -> bool {
        let used_tokens = self.get_usage(api_key).await;
        let within_limit = used_tokens < max_tokens;
        if !within_limit {
            self.metrics.record_limit_exceeded();
            info!(
                api_key = %mask_api_key(api_key),
                used_tokens,
                max_tokens,
                "Token limit exceeded"
            );
        }
        within_limit
    }

    /// [`Self::check_limit`] against the key's tariff.
    pub async fn check_tariff_limit(&self, api_key: &str) -> bool {
        let tariff = self.tariffs.get_tariff(api_key);
        self.check_limit(api_key, tariff.max_tokens).await
    }

    /// Zero the key's counter. Idempotent; the record itself stays.
    ///
    /// When the backend serves the reset, the fallback copy of the record is
    /// dropped as well so a later outage does not bring back the old count.
    pub async fn reset_usage(&self, api_key: &str) -> bool {
        let counter = usage_key(api_key);
        let updated = usage_updated_key(api_key);
        let (counter_key, updated_key) = (counter.as_str(), updated.as_str());
        let now = Utc::now().to_rfc3339();
        let now = now.as_str();

        let result = self
            .health
            .execute("reset_usage", move |store| async move {
                store.set(counter_key, "0").await?;
                store.set(updated_key, now).await?;
                Ok::<_, Error>(())
            })
            .await;

        match result {
            Ok(served) => {
                if served.storage == StorageType::Backend {
                    self.health.clear_fallback(&[counter_key, updated_key]).await;
                }
                info!(
                    api_key = %mask_api_key(api_key),
                    storage_type = ?served.storage,
                    "Reset token usage"
                );
                true
            }
            Err(e) => {
                self.metrics.record_failed_operation();
                error!(api_key = %mask_api_key(api_key), "Failed to reset token usage: {e}");
                false
            }
        }
    }

    async fn scan_usage_keys(&self) -> Result<Served<Vec<String>>, Error> {
        self.health
            .execute("scan_prefix", |store| store.scan_prefix(USAGE_KEY_PREFIX))
            .await
    }

    /// Drop fallback records of keys the backend does not know about. They
    /// were written during an outage and would survive the reset otherwise.
    async fn clear_stale_fallback_usage(&self, reset_keys: &HashSet<String>) {
        let stale = match self.health.fallback().scan_prefix(USAGE_KEY_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to scan the fallback store during monthly reset: {e}");
                return;
            }
        };

        let mut cleared = 0;
        for counter_key in stale.iter().filter(|key| !reset_keys.contains(*key)) {
            let Some(api_key) = counter_key.strip_prefix(USAGE_KEY_PREFIX) else {
                continue;
            };
            let updated = usage_updated_key(api_key);
            self.health
                .clear_fallback(&[counter_key.as_str(), updated.as_str()])
                .await;
            cleared += 1;
        }
        if cleared > 0 {
            info!(cleared, "Cleared fallback usage records left from an outage");
        }
    }

    /// Reset every known key. Each key is reset independently; a failure is
    /// counted and the loop moves on. A failed scan counts as one error.
    pub async fn reset_monthly_usage(&self) -> MonthlyResetSummary {
        let mut reset_count = 0;
        let mut error_count = 0;

        match self.scan_usage_keys().await {
            Ok(served) => {
                let from_backend = served.storage == StorageType::Backend;
                let reset_keys: HashSet<String> = served.value.into_iter().collect();
                for key in &reset_keys {
                    let Some(api_key) = key.strip_prefix(USAGE_KEY_PREFIX) else {
                        continue;
                    };
                    if self.reset_usage(api_key).await {
                        reset_count += 1;
                    } else {
                        error_count += 1;
                    }
                }
                if from_backend {
                    self.clear_stale_fallback_usage(&reset_keys).await;
                }
            }
            Err(e) => {
                self.metrics.record_failed_operation();
                error!("Failed to enumerate usage keys for monthly reset: {e}");
                error_count += 1;
            }
        }

        info!(reset_count, error_count, "Monthly usage reset finished");
        MonthlyResetSummary {
            reset_count,
            error_count,
            timestamp: Utc::now(),
        }
    }

    pub async fn get_detailed_usage(&self, api_key: &str) -> DetailedUsage {
        let counter = usage_key(api_key);
        let updated = usage_updated_key(api_key);
        let (counter_key, updated_key) = (counter.as_str(), updated.as_str());

        match self
            .health
            .execute("get_detailed_usage", |store| {
                read_record(store, counter_key, updated_key)
            })
            .await
        {
            Ok(served) => {
                let (used_tokens, last_updated) = served.value;
                DetailedUsage {
                    api_key: mask_api_key(api_key),
                    used_tokens,
                    last_updated,
                    storage_type: served.storage,
                }
            }
            Err(e) => {
                self.metrics.record_failed_operation();
                warn!(
                    api_key = %mask_api_key(api_key),
                    "Reading detailed usage failed, reporting 0: {e}"
                );
                DetailedUsage {
                    api_key: mask_api_key(api_key),
                    used_tokens: 0,
                    last_updated: None,
                    storage_type: self.health.storage_type(),
                }
            }
        }
    }

    /// Aggregate usage over every known key. Keys whose counters cannot be
    /// read are skipped and counted in `skipped_keys`.
    pub async fn get_all_usage_stats(&self) -> UsageStats {
        let (keys, storage_type) = match self.scan_usage_keys().await {
            Ok(served) => (served.value, served.storage),
            Err(e) => {
                self.metrics.record_failed_operation();
                error!("Failed to enumerate usage keys for statistics: {e}");
                (Vec::new(), self.health.storage_type())
            }
        };

        let mut keys_usage = Vec::with_capacity(keys.len());
        let mut skipped_keys = 0;
        let mut total_tokens = 0u64;

        for key in keys {
            let Some(api_key) = key.strip_prefix(USAGE_KEY_PREFIX) else {
                continue;
            };
            let updated = usage_updated_key(api_key);
            let (counter_key, updated_key) = (key.as_str(), updated.as_str());
            match self
                .health
                .execute("get_all_usage_stats", |store| {
                    read_record(store, counter_key, updated_key)
                })
                .await
            {
                Ok(served) => {
                    let (used_tokens, last_updated) = served.value;
                    total_tokens = total_tokens.saturating_add(used_tokens);
                    keys_usage.push(KeyUsage {
                        api_key: mask_api_key(api_key),
                        used_tokens,
                        last_updated,
                    });
                }
                Err(e) => {
                    skipped_keys += 1;
                    warn!(
                        api_key = %mask_api_key(api_key),
                        "Skipping key in usage statistics: {e}"
                    );
                }
            }
        }

        UsageStats {
            total_keys: keys_usage.len(),
            total_tokens,
            keys_usage,
            skipped_keys,
            storage_type,
            timestamp: Utc::now(),
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        self.health.health_check().await
    }
}
