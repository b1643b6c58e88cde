use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, ErrorDetails};
use crate::kv::KvBackend;

const BACKEND_NAME: &str = "memory";

#[derive(Clone, Debug)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn zero() -> Self {
        Self {
            value: "0".to_string(),
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Process-local counter store used while the shared backend is unreachable.
///
/// Entries live in a sharded `DashMap`, so an increment only locks the shard
/// that owns its key. Expiry is a deadline checked lazily on access; expired
/// entries behave exactly like absent ones.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| !stored.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn increment(&self, key: &str, delta: i64, expiry: Option<Duration>) -> Result<i64, Error> {
        let now = Instant::now();
        // The shard write lock is held until `stored` drops, which makes the
        // read-modify-write below atomic for this key.
        let mut stored = self
            .entries
            .entry(key.to_string())
            .or_insert_with(StoredValue::zero);
        if stored.is_expired(now) {
            *stored = StoredValue::zero();
        }

        let current = stored.value.parse::<i64>().map_err(|_| {
            Error::new(ErrorDetails::InvalidCounterValue {
                key: key.to_string(),
                value: stored.value.clone(),
            })
        })?;
        let next = current.checked_add(delta).ok_or_else(|| {
            Error::new(ErrorDetails::BackendCommand {
                backend: BACKEND_NAME.to_string(),
                operation: "atomic_increment".to_string(),
                message: format!("incrementing `{key}` by {delta} would overflow"),
            })
        })?;

        stored.value = next.to_string();
        if let Some(ttl) = expiry {
            if stored.expires_at.is_none() {
                stored.expires_at = Some(now + ttl);
            }
        }
        Ok(next)
    }
}

#[async_trait]
impl KvBackend for MemoryStore {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let now = Instant::now();
        let lookup = self
            .entries
            .get(key)
            .map(|stored| (!stored.is_expired(now)).then(|| stored.value.clone()));

        match lookup {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                self.entries.remove_if(key, |_, stored| stored.is_expired(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn atomic_increment(&self, key: &str, delta: i64) -> Result<i64, Error> {
        self.increment(key, delta, None)
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: i64,
        seconds: u64,
    ) -> Result<i64, Error> {
        self.increment(key, delta, Some(Duration::from_secs(seconds)))
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, Error> {
        let now = Instant::now();
        let updated = match self.entries.get_mut(key) {
            Some(mut stored) if !stored.is_expired(now) => {
                stored.expires_at = Some(now + Duration::from_secs(seconds));
                true
            }
            _ => false,
        };
        if !updated {
            self.entries.remove_if(key, |_, stored| stored.is_expired(now));
        }
        Ok(updated)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, Error> {
        let now = Instant::now();
        Ok(self.entries.get(key).and_then(|stored| {
            let deadline = stored.expires_at?;
            let remaining = deadline.checked_duration_since(now)?;
            if remaining.is_zero() {
                return None;
            }
            // Round up so a live key never reports 0 seconds left.
            Some(remaining.as_millis().div_ceil(1000) as u64)
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, stored)| !stored.is_expired(now)))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        self.purge_expired();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }
}
