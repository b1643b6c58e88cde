use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorDetails};
use crate::kv::{KvBackend, RATE_LIMIT_KEY_PREFIX, USAGE_KEY_PREFIX};

/// Which store served an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Backend,
    Fallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendConnection {
    Connected,
    Disconnected,
    NotConfigured,
}

/// Snapshot of the monitor's state machine.
#[derive(Clone, Debug, Serialize)]
pub struct BackendState {
    pub active: StorageType,
    pub last_probe: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub backend_connected: bool,
    pub backend_configured: bool,
    pub active_backend: StorageType,
    pub consecutive_failures: u32,
    pub last_probe: Option<DateTime<Utc>>,
    /// Usage and rate-limit keys currently held by the fallback store
    pub fallback_keys: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct BackendHealth {
    pub status: BackendConnection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<&'static str>,
}

/// A value together with the store that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct Served<T> {
    pub value: T,
    pub storage: StorageType,
}

/// Routes counter operations to the shared backend while it is healthy and
/// to the in-process fallback otherwise.
///
/// State machine: `Healthy -> Degraded` on the first failed or timed-out
/// backend call, `Degraded -> Healthy` only after a successful probe. The
/// monitor is the only writer of this state; everything else reads it.
pub struct BackendHealthMonitor {
    backend: Option<Arc<dyn KvBackend>>,
    fallback: Arc<dyn KvBackend>,
    backend_up: AtomicBool,
    consecutive_failures: AtomicU32,
    last_probe: ArcSwapOption<DateTime<Utc>>,
    /// Upper bound for a single backend call on the request path
    operation_timeout: Duration,
    probe_interval: Duration,
    probe_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackendHealthMonitor {
    /// Build a monitor in the `Degraded` state. Call [`Self::initialize`] to
    /// make the first connection attempt.
    pub fn new(
        backend: Option<Arc<dyn KvBackend>>,
        fallback: Arc<dyn KvBackend>,
        operation_timeout: Duration,
        probe_interval: Duration,
    ) -> Self {
        Self {
            backend,
            fallback,
            backend_up: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            last_probe: ArcSwapOption::empty(),
            operation_timeout,
            probe_interval,
            probe_handle: Mutex::new(None),
        }
    }

    /// Startup connection attempt.
    pub async fn initialize(&self) -> HealthReport {
        match &self.backend {
            Some(backend) => {
                if self.probe_now().await {
                    info!(backend = backend.name(), "Counter backend connected");
                } else {
                    warn!(
                        backend = backend.name(),
                        "Failed to connect to counter backend, using in-memory fallback storage"
                    );
                }
            }
            None => {
                info!("No counter backend configured, using in-memory storage only");
            }
        }
        self.health_check().await
    }

    pub fn backend_configured(&self) -> bool {
        self.backend.is_some()
    }

    pub fn is_backend_up(&self) -> bool {
        self.backend.is_some() && self.backend_up.load(Ordering::Acquire)
    }

    /// The store the next operation will be routed to.
    pub fn storage_type(&self) -> StorageType {
        if self.is_backend_up() {
            StorageType::Backend
        } else {
            StorageType::Fallback
        }
    }

    pub fn fallback(&self) -> &Arc<dyn KvBackend> {
        &self.fallback
    }

    /// Run `op` against the active store.
    ///
    /// A backend fault or timeout flips the monitor to `Degraded` and the same
    /// call is re-run on the fallback, so the caller waits at most one
    /// backend timeout. Only a fault on the fallback as well is surfaced, as
    /// `Unrecoverable`.
    pub async fn execute<'a, T, F, Fut>(&'a self, operation: &'static str, op: F) -> Result<Served<T>, Error>
    where
        F: Fn(&'a dyn KvBackend) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        if let Some(backend) = self.active_backend() {
            match timeout(self.operation_timeout, op(backend)).await {
                Ok(Ok(value)) => {
                    return Ok(Served {
                        value,
                        storage: StorageType::Backend,
                    })
                }
                Ok(Err(e)) if e.is_backend_fault() => self.record_failure(operation, &e),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    let e = Error::new_without_logging(ErrorDetails::BackendTimeout {
                        backend: backend.name().to_string(),
                        operation: operation.to_string(),
                        timeout_ms: self.operation_timeout.as_millis() as u64,
                    });
                    self.record_failure(operation, &e);
                }
            }
        }

        match op(self.fallback.as_ref()).await {
            Ok(value) => Ok(Served {
                value,
                storage: StorageType::Fallback,
            }),
            Err(e) if e.is_backend_fault() => Err(Error::new(ErrorDetails::Unrecoverable {
                operation: operation.to_string(),
                message: e.to_string(),
            })),
            Err(e) => Err(e),
        }
    }

    fn active_backend(&self) -> Option<&dyn KvBackend> {
        if self.backend_up.load(Ordering::Acquire) {
            self.backend.as_deref()
        } else {
            None
        }
    }

    fn record_failure(&self, operation: &str, error: &Error) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if self.backend_up.swap(false, Ordering::AcqRel) {
            warn!(
                operation = operation,
                consecutive_failures = failures,
                "Counter backend unavailable ({error}), routing to in-memory fallback"
            );
        } else {
            debug!(operation = operation, "Counter backend still unavailable: {error}");
        }
    }

    async fn record_recovery(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if !self.backend_up.swap(true, Ordering::AcqRel) {
            info!("Counter backend reachable again, resuming backend storage");
            self.log_divergence().await;
        }
    }

    /// Number of usage and rate-limit keys in the fallback store.
    pub async fn fallback_key_count(&self) -> usize {
        let mut count = 0;
        for prefix in [USAGE_KEY_PREFIX, RATE_LIMIT_KEY_PREFIX] {
            match self.fallback.scan_prefix(prefix).await {
                Ok(keys) => count += keys.len(),
                Err(e) => debug!("Failed to scan fallback store for `{prefix}`: {e}"),
            }
        }
        count
    }

    /// Delete `keys` from the fallback store.
    ///
    /// Called after the backend served a reset: a copy left over from an
    /// earlier outage would otherwise be served again in the next one.
    /// Failures are logged and otherwise ignored.
    pub async fn clear_fallback(&self, keys: &[&str]) {
        for key in keys {
            if let Err(e) = self.fallback.delete(key).await {
                debug!("Failed to clear a fallback counter: {e}");
            }
        }
    }

    /// Fallback counters are not merged into the backend after an outage.
    /// Report how many were left behind.
    async fn log_divergence(&self) {
        let diverged = self.fallback_key_count().await;
        if diverged > 0 {
            warn!(
                fallback_keys = diverged,
                "Counters recorded in the fallback store during the outage are not merged; the backend is authoritative"
            );
        }
    }

    /// Ping the backend once. Returns whether it is reachable.
    pub async fn probe_now(&self) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };

        // A reconnect is a connect plus a PING, each bounded by the backend timeout.
        let probe_timeout = self.operation_timeout.saturating_mul(2);
        let result = timeout(probe_timeout, backend.ping()).await;
        self.last_probe.store(Some(Arc::new(Utc::now())));

        match result {
            Ok(Ok(())) => {
                self.record_recovery().await;
                true
            }
            Ok(Err(e)) => {
                self.record_failure("ping", &e);
                false
            }
            Err(_) => {
                let e = Error::new_without_logging(ErrorDetails::BackendTimeout {
                    backend: backend.name().to_string(),
                    operation: "ping".to_string(),
                    timeout_ms: probe_timeout.as_millis() as u64,
                });
                self.record_failure("ping", &e);
                false
            }
        }
    }

    /// Start the background probe. Replaces a running probe.
    pub async fn spawn_probe(self: &Arc<Self>) {
        if self.backend.is_none() {
            debug!("No counter backend configured, health probe not started");
            return;
        }

        let monitor: Weak<Self> = Arc::downgrade(self);
        let probe_interval = self.probe_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.probe_now().await;
            }
        });

        if let Some(previous) = self.probe_handle.lock().await.replace(handle) {
            previous.abort();
        }
    }

    pub async fn stop_probe(&self) {
        if let Some(handle) = self.probe_handle.lock().await.take() {
            handle.abort();
        }
    }

    pub fn state(&self) -> BackendState {
        BackendState {
            active: self.storage_type(),
            last_probe: self.last_probe.load_full().map(|at| *at),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        let fallback_keys = self.fallback_key_count().await;
        let state = self.state();
        let backend_connected = self.is_backend_up();
        HealthReport {
            status: if backend_connected {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            backend_connected,
            backend_configured: self.backend_configured(),
            active_backend: state.active,
            consecutive_failures: state.consecutive_failures,
            last_probe: state.last_probe,
            fallback_keys,
        }
    }

    pub fn backend_health(&self) -> BackendHealth {
        let status = if self.backend.is_none() {
            BackendConnection::NotConfigured
        } else if self.is_backend_up() {
            BackendConnection::Connected
        } else {
            BackendConnection::Disconnected
        };
        BackendHealth {
            status,
            fallback: (status != BackendConnection::Connected).then_some("memory_storage"),
        }
    }
}

impl Drop for BackendHealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.probe_handle.get_mut().take() {
            handle.abort();
        }
    }
}
