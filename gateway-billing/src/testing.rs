#![cfg(test)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, ErrorDetails};
use crate::kv::{KvBackend, MemoryStore};

/// A `MemoryStore` that can be told to stall, go away, or refuse writes to
/// particular keys.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    unavailable: AtomicBool,
    delay: Mutex<Option<Duration>>,
    failing_writes: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Writes (`set`, `delete`, increments) to keys containing `fragment` fail.
    pub fn fail_writes_to(&self, fragment: &str) {
        self.failing_writes.lock().unwrap().push(fragment.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, operation: &str) -> Result<(), Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::new_without_logging(ErrorDetails::BackendUnavailable {
                backend: "faulty".to_string(),
                message: format!("refused `{operation}`"),
            }));
        }
        Ok(())
    }

    async fn enter_write(&self, operation: &str, key: &str) -> Result<(), Error> {
        self.enter(operation).await?;
        let refused = self
            .failing_writes
            .lock()
            .unwrap()
            .iter()
            .any(|fragment| key.contains(fragment.as_str()));
        if refused {
            return Err(Error::new_without_logging(ErrorDetails::BackendCommand {
                backend: "faulty".to_string(),
                operation: operation.to_string(),
                message: format!("write to `{key}` refused"),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for FaultyStore {
    fn name(&self) -> &'static str {
        "faulty"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.enter("get").await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.enter_write("set", key).await?;
        self.inner.set(key, value).await
    }

    async fn atomic_increment(&self, key: &str, delta: i64) -> Result<i64, Error> {
        self.enter_write("atomic_increment", key).await?;
        self.inner.atomic_increment(key, delta).await
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: i64,
        seconds: u64,
    ) -> Result<i64, Error> {
        self.enter_write("increment_with_expiry", key).await?;
        self.inner.increment_with_expiry(key, delta, seconds).await
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, Error> {
        self.enter("expire").await?;
        self.inner.expire(key, seconds).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, Error> {
        self.enter("ttl").await?;
        self.inner.ttl(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        self.enter_write("delete", key).await?;
        self.inner.delete(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        self.enter("scan_prefix").await?;
        self.inner.scan_prefix(prefix).await
    }

    async fn ping(&self) -> Result<(), Error> {
        self.enter("ping").await
    }
}
