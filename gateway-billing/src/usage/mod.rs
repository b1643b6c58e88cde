pub mod tracker;

pub use tracker::UsageTracker;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::health::StorageType;

/// Usage of a single key, as returned to admin callers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetailedUsage {
    /// Masked API key
    pub api_key: String,
    pub used_tokens: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub storage_type: StorageType,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KeyUsage {
    pub api_key: String,
    pub used_tokens: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct UsageStats {
    pub total_keys: usize,
    pub total_tokens: u64,
    pub keys_usage: Vec<KeyUsage>,
    /// Keys found by the scan whose counters could not be read
    pub skipped_keys: usize,
    pub storage_type: StorageType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MonthlyResetSummary {
    pub reset_count: usize,
    pub error_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Counters for usage tracking activity
#[derive(Debug, Default)]
pub struct UsageTrackerMetrics {
    pub increments: AtomicU64,
    pub tokens_recorded: AtomicU64,
    pub rejected_increments: AtomicU64,
    pub failed_operations: AtomicU64,
    pub limit_exceeded: AtomicU64,
}

impl UsageTrackerMetrics {
    pub fn record_increment(&self, tokens: u64) {
        self.increments.fetch_add(1, Ordering::Relaxed);
        self.tokens_recorded.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn record_rejected_increment(&self) {
        self.rejected_increments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_operation(&self) {
        self.failed_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_limit_exceeded(&self) {
        self.limit_exceeded.fetch_add(1, Ordering::Relaxed);
    }
}
