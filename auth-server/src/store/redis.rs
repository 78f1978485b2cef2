use super::{KeyValueStore, StoreError, StoreValue};
use crate::config::RedisConfig;
use async_trait::async_trait;
use log::error;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Redis-protocol store. Dragonfly speaks the same protocol and reuses this
/// backend under its own name.
///
/// Each connection manager multiplexes one connection; `pool_size` of them are
/// opened and handed out round-robin.
#[derive(Clone)]
pub struct RedisStore {
    _client: Client,
    connections: Arc<Vec<ConnectionManager>>,
    next: Arc<AtomicUsize>,
    default_ttl: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    flavor: &'static str,
}

impl RedisStore {
    /// Connect to the server described by `config` and verify it answers PING
    pub async fn new(config: &RedisConfig, flavor: &'static str) -> Result<Self, StoreError> {
        if config.address.is_empty() {
            return Err(StoreError::Config(format!(
                "An address is required for the {} store",
                flavor
            )));
        }

        let client = Client::open(connection_url(config)).map_err(|err| {
            StoreError::Config(format!("Failed to connect to {}: {}", flavor, err))
        })?;

        let mut connections = Vec::with_capacity(config.pool_size.max(1));
        for _ in 0..config.pool_size.max(1) {
            let conn_manager = ConnectionManager::new(client.clone())
                .await
                .map_err(|err| {
                    StoreError::Backend(format!(
                        "Failed to create {} connection manager: {}",
                        flavor, err
                    ))
                })?;
            connections.push(conn_manager);
        }

        // Test the connection to ensure it's working
        let mut conn = connections[0].clone();
        if let Err(err) = redis::cmd("PING").query_async::<String>(&mut conn).await {
            return Err(StoreError::Backend(format!(
                "Failed to ping {}: {}",
                flavor, err
            )));
        }

        Ok(Self {
            _client: client,
            connections: Arc::new(connections),
            next: Arc::new(AtomicUsize::new(0)),
            default_ttl: config.ttl,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            flavor,
        })
    }

    pub fn flavor(&self) -> &'static str {
        self.flavor
    }

    fn connection(&self) -> ConnectionManager {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[index].clone()
    }

    async fn with_timeout<T, F>(
        &self,
        limit: Duration,
        op: &str,
        key: &str,
        fut: F,
    ) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let result = if limit.is_zero() {
            fut.await
        } else {
            match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    error!("{} timed out while {} key {}", self.flavor, op, key);
                    return Err(StoreError::Timeout);
                }
            }
        };
        result.map_err(|err| {
            error!("{} error while {} key {}: {}", self.flavor, op, key, err);
            StoreError::Backend(err.to_string())
        })
    }
}

/// Build `redis://[:password@]address/db` from the structured configuration
fn connection_url(config: &RedisConfig) -> String {
    let address = config
        .address
        .trim_start_matches("redis://")
        .trim_end_matches('/');
    if config.password.is_empty() {
        format!("redis://{}/{}", address, config.db)
    } else {
        format!("redis://:{}@{}/{}", config.password, address, config.db)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let bytes = value.into_bytes();
        self.with_timeout(
            self.write_timeout,
            "setting",
            key,
            conn.set::<_, _, ()>(key, bytes),
        )
        .await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: StoreValue,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        if ttl.is_zero() {
            return self.set(key, value).await;
        }

        let mut conn = self.connection();
        let bytes = value.into_bytes();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.with_timeout(
            self.write_timeout,
            "setting",
            key,
            conn.pset_ex::<_, _, ()>(key, bytes, millis),
        )
        .await
    }

    async fn get(&self, key: &str) -> Result<StoreValue, StoreError> {
        let mut conn = self.connection();
        let value: Option<Vec<u8>> = self
            .with_timeout(self.read_timeout, "getting", key, conn.get(key))
            .await?;
        value.map(StoreValue::Bytes).ok_or(StoreError::KeyNotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        self.with_timeout(self.write_timeout, "deleting", key, conn.del::<_, ()>(key))
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        self.with_timeout(self.read_timeout, "checking", key, conn.exists(key))
            .await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection();
        self.with_timeout(self.read_timeout, "listing", pattern, conn.keys(pattern))
            .await
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        let mut conn = self.connection();
        self.with_timeout(
            self.write_timeout,
            "flushing",
            "*",
            redis::cmd("FLUSHDB").query_async::<()>(&mut conn),
        )
        .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        // Connection managers close their connections once the last clone drops
        Ok(())
    }

    async fn health_check(&self) -> Result<(), String> {
        let mut conn = self.connection();
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => Ok(()),
            Err(err) => Err(format!("{} health check failed: {}", self.flavor, err)),
        }
    }
}
