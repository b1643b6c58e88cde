use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, ErrorKind, RedisError, Script};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{Error, ErrorDetails};
use crate::kv::KvBackend;

const BACKEND_NAME: &str = "redis";
const SCAN_BATCH_SIZE: usize = 100;

/// Whether Redis answered and refused the command because of the data it
/// holds (`ERR value is not an integer`, `WRONGTYPE`), as opposed to the
/// connection failing. The server is healthy in that case.
fn is_data_error(err: &RedisError) -> bool {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        return false;
    }
    matches!(err.kind(), ErrorKind::TypeError | ErrorKind::ResponseError)
        || err.code() == Some("WRONGTYPE")
}

/// Shared counter store backed by Redis.
///
/// The multiplexed connection is established lazily by `ping`, which the
/// health monitor calls at startup and from its probe task. Request-path
/// commands never reconnect: with no connection they fail fast so the caller
/// is served by the fallback store.
pub struct RedisStore {
    client: redis::Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    connect_timeout: Duration,
    /// Lua script for atomic increment with expiry on first write
    increment_with_expiry_script: Script,
}

impl RedisStore {
    /// Validate the URL and build a disconnected store.
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;

        let increment_with_expiry_script = Script::new(
            r#"
            local current = redis.call('INCRBY', KEYS[1], ARGV[1])
            if redis.call('TTL', KEYS[1]) < 0 then
                redis.call('EXPIRE', KEYS[1], ARGV[2])
            end
            return current
            "#,
        );

        Ok(Self {
            client,
            connection: RwLock::new(None),
            connect_timeout,
            increment_with_expiry_script,
        })
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    async fn connection(&self) -> Result<MultiplexedConnection, Error> {
        self.connection.read().await.clone().ok_or_else(|| {
            Error::new_without_logging(ErrorDetails::BackendUnavailable {
                backend: BACKEND_NAME.to_string(),
                message: "no open connection".to_string(),
            })
        })
    }

    async fn connect(&self) -> Result<MultiplexedConnection, Error> {
        let conn = timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            Error::new_without_logging(ErrorDetails::BackendTimeout {
                backend: BACKEND_NAME.to_string(),
                operation: "connect".to_string(),
                timeout_ms: self.connect_timeout.as_millis() as u64,
            })
        })?
        .map_err(|e| {
            Error::new_without_logging(ErrorDetails::BackendUnavailable {
                backend: BACKEND_NAME.to_string(),
                message: e.to_string(),
            })
        })?;

        *self.connection.write().await = Some(conn.clone());
        info!("Connected to Redis for usage accounting");
        Ok(conn)
    }

    /// Convert a command failure, dropping the connection if it is broken so
    /// the next probe reconnects. Data errors leave the connection alone and
    /// are not backend faults.
    async fn command_error(&self, operation: &str, err: RedisError) -> Error {
        if is_data_error(&err) {
            return Error::new(ErrorDetails::BackendRejected {
                backend: BACKEND_NAME.to_string(),
                operation: operation.to_string(),
                message: err.to_string(),
            });
        }
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            debug!("Dropping Redis connection after `{operation}` failed: {err}");
            *self.connection.write().await = None;
        }
        Error::new_without_logging(ErrorDetails::BackendCommand {
            backend: BACKEND_NAME.to_string(),
            operation: operation.to_string(),
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl KvBackend for RedisStore {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.connection().await?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => Ok(value),
            Err(e) => Err(self.command_error("get", e).await),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut conn = self.connection().await?;
        match conn.set::<_, _, ()>(key, value).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.command_error("set", e).await),
        }
    }

    async fn atomic_increment(&self, key: &str, delta: i64) -> Result<i64, Error> {
        let mut conn = self.connection().await?;
        match conn.incr::<_, _, i64>(key, delta).await {
            Ok(value) => Ok(value),
            Err(e) => Err(self.command_error("atomic_increment", e).await),
        }
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: i64,
        seconds: u64,
    ) -> Result<i64, Error> {
        let mut conn = self.connection().await?;
        let result: Result<i64, RedisError> = self
            .increment_with_expiry_script
            .key(key)
            .arg(delta)
            .arg(seconds)
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.command_error("increment_with_expiry", e).await),
        }
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, Error> {
        let mut conn = self.connection().await?;
        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
        match conn.expire::<_, bool>(key, seconds).await {
            Ok(updated) => Ok(updated),
            Err(e) => Err(self.command_error("expire", e).await),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, Error> {
        let mut conn = self.connection().await?;
        // -2: no such key, -1: key without expiry
        match conn.ttl::<_, i64>(key).await {
            Ok(seconds) => Ok(u64::try_from(seconds).ok()),
            Err(e) => Err(self.command_error("ttl", e).await),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        let mut conn = self.connection().await?;
        match conn.del::<_, i64>(key).await {
            Ok(removed) => Ok(removed > 0),
            Err(e) => Err(self.command_error("delete", e).await),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.connection().await?;
        let pattern = format!("{prefix}*");
        let mut cursor = 0u64;
        let mut keys = Vec::new();

        loop {
            let result: Result<(u64, Vec<String>), RedisError> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH_SIZE)
                .query_async(&mut conn)
                .await;

            match result {
                Ok((next_cursor, batch)) => {
                    keys.extend(batch);
                    cursor = next_cursor;
                    if cursor == 0 {
                        break;
                    }
                }
                Err(e) => return Err(self.command_error("scan_prefix", e).await),
            }
        }

        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), Error> {
        let existing = self.connection.read().await.clone();
        let mut conn = match existing {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        let result = timeout(self.connect_timeout, async {
            let pong: Result<String, RedisError> =
                redis::cmd("PING").query_async(&mut conn).await;
            pong
        })
        .await;

        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                *self.connection.write().await = None;
                Err(Error::new_without_logging(ErrorDetails::BackendUnavailable {
                    backend: BACKEND_NAME.to_string(),
                    message: e.to_string(),
                }))
            }
            Err(_) => {
                *self.connection.write().await = None;
                Err(Error::new_without_logging(ErrorDetails::BackendTimeout {
                    backend: BACKEND_NAME.to_string(),
                    operation: "ping".to_string(),
                    timeout_ms: self.connect_timeout.as_millis() as u64,
                }))
            }
        }
    }
}
