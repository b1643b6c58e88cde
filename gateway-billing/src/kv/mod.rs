pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;

use crate::error::Error;

/// Namespace for per-key token counters.
pub const USAGE_KEY_PREFIX: &str = "token_usage:";
/// Namespace for the `last_updated` timestamp paired with each token counter.
pub const USAGE_UPDATED_KEY_PREFIX: &str = "token_usage_updated:";
/// Namespace for fixed-window request counters.
pub const RATE_LIMIT_KEY_PREFIX: &str = "rate_limit:";

pub fn usage_key(api_key: &str) -> String {
    format!("{USAGE_KEY_PREFIX}{api_key}")
}

pub fn usage_updated_key(api_key: &str) -> String {
    format!("{USAGE_UPDATED_KEY_PREFIX}{api_key}")
}

pub fn rate_limit_key(api_key: &str) -> String {
    format!("{RATE_LIMIT_KEY_PREFIX}{api_key}")
}

/// A string-valued counter store.
///
/// Implementations must make `atomic_increment` and `increment_with_expiry`
/// linearizable per key: concurrent increments never lose updates.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    /// Add `delta` to the integer stored at `key` (absent reads as 0) and
    /// return the new value.
    async fn atomic_increment(&self, key: &str, delta: i64) -> Result<i64, Error>;

    /// Increment `key` and, if it carries no expiry yet, expire it after
    /// `seconds`. Both happen as one atomic step.
    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: i64,
        seconds: u64,
    ) -> Result<i64, Error>;

    /// Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, Error>;

    /// Remaining lifetime in seconds, `None` if the key is absent or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<u64>, Error>;

    /// Returns `true` if a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, Error>;

    /// All live keys starting with `prefix`, in no particular order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, Error>;

    async fn ping(&self) -> Result<(), Error>;
}
