pub mod config;
pub mod limiter;

pub use config::RateLimitConfig;
pub use limiter::RateLimiter;

use http::{HeaderMap, HeaderValue};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::health::StorageType;

/// State of one key's request window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    /// Masked API key
    pub api_key: String,
    pub current_count: u64,
    pub limit: u32,
    pub remaining: u32,
    pub window_seconds: u64,
    /// Seconds until the current window expires
    pub reset_after: u64,
    /// Unix timestamp at which the current window expires
    pub reset_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    pub storage_type: StorageType,
}

impl RateLimitStatus {
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        // Numbers always produce valid header values.
        if let Ok(value) = HeaderValue::from_str(&self.limit.to_string()) {
            headers.insert("X-RateLimit-Limit", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.remaining.to_string()) {
            headers.insert("X-RateLimit-Remaining", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.reset_at.to_string()) {
            headers.insert("X-RateLimit-Reset", value);
        }

        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert("Retry-After", value);
            }
        }

        headers
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", content = "status", rename_all = "snake_case")]
pub enum RateLimitDecision {
    Allow(RateLimitStatus),
    Deny(RateLimitStatus),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow(_))
    }

    pub fn status(&self) -> &RateLimitStatus {
        match self {
            RateLimitDecision::Allow(s) | RateLimitDecision::Deny(s) => s,
        }
    }

    pub fn into_status(self) -> RateLimitStatus {
        match self {
            RateLimitDecision::Allow(s) | RateLimitDecision::Deny(s) => s,
        }
    }
}

/// Counters for rate limiter decisions
#[derive(Debug, Default)]
pub struct RateLimiterMetrics {
    pub allowed: AtomicU64,
    pub denied: AtomicU64,
    pub fallback_decisions: AtomicU64,
    pub store_errors: AtomicU64,
}

impl RateLimiterMetrics {
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_decision(&self) {
        self.fallback_decisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }
}
