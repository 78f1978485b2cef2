use crate::config::{StoreConfig, StoreType};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod badger;
pub mod lightning;
pub mod memcached;
pub(crate) mod pattern;
pub mod redis;

/// Errors that can occur during key/value store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key not found")]
    KeyNotFound,
    #[error("Store capacity reached ({0} items)")]
    CapacityReached(usize),
    #[error("Operation not supported by the {0} backend")]
    Unsupported(&'static str),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Backend operation timed out")]
    Timeout,
    #[error("Configuration error: {0}")]
    Config(String),
}

/// A stored value. Backends accept both shapes; remote backends hand back
/// whatever they keep on the wire, which is always raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreValue {
    Bytes(Vec<u8>),
    Text(String),
}

impl StoreValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.as_bytes(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.into_bytes(),
        }
    }
}

impl From<Vec<u8>> for StoreValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<String> for StoreValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for StoreValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Capability set shared by every key/value backend.
///
/// `get` reports absent and expired keys alike as [`StoreError::KeyNotFound`].
/// `delete` is idempotent. A zero TTL passed to `set_with_ttl` means "backend
/// default", which is "no expiry" for backends without a configured default.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set(&self, key: &str, value: StoreValue) -> Result<(), StoreError>;

    async fn set_with_ttl(
        &self,
        key: &str,
        value: StoreValue,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<StoreValue, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// List keys matching a glob pattern (`*` and `?`)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn flush_all(&self) -> Result<(), StoreError>;

    /// Release background tasks and connections
    async fn close(&self) -> Result<(), StoreError>;

    /// Performs a deep health check on the backend
    async fn health_check(&self) -> Result<(), String>;
}

/// Store implementation selected at boot from configuration.
#[derive(Clone)]
pub enum Store {
    /// In-process bounded map with periodic expiry sweep
    Lightning(lightning::LightningStore),
    /// Redis protocol backend (also used for Dragonfly)
    Redis(redis::RedisStore),
    /// Memcached backend
    Memcached(memcached::MemcachedStore),
    /// Embedded file-backed key/value store
    Badger(badger::BadgerStore),
}

impl Store {
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Lightning(_) => "lightning",
            Self::Redis(store) => store.flavor(),
            Self::Memcached(_) => "memcached",
            Self::Badger(_) => "badger",
        }
    }

    /// Hit and size counters; only the lightning backend keeps them
    pub async fn stats(&self) -> Option<lightning::StoreStats> {
        match self {
            Self::Lightning(store) => Some(store.stats().await),
            _ => None,
        }
    }
}

#[async_trait]
impl KeyValueStore for Store {
    async fn set(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        match self {
            Self::Lightning(store) => store.set(key, value).await,
            Self::Redis(store) => store.set(key, value).await,
            Self::Memcached(store) => store.set(key, value).await,
            Self::Badger(store) => store.set(key, value).await,
        }
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: StoreValue,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        match self {
            Self::Lightning(store) => store.set_with_ttl(key, value, ttl).await,
            Self::Redis(store) => store.set_with_ttl(key, value, ttl).await,
            Self::Memcached(store) => store.set_with_ttl(key, value, ttl).await,
            Self::Badger(store) => store.set_with_ttl(key, value, ttl).await,
        }
    }

    async fn get(&self, key: &str) -> Result<StoreValue, StoreError> {
        match self {
            Self::Lightning(store) => store.get(key).await,
            Self::Redis(store) => store.get(key).await,
            Self::Memcached(store) => store.get(key).await,
            Self::Badger(store) => store.get(key).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self {
            Self::Lightning(store) => store.delete(key).await,
            Self::Redis(store) => store.delete(key).await,
            Self::Memcached(store) => store.delete(key).await,
            Self::Badger(store) => store.delete(key).await,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self {
            Self::Lightning(store) => store.exists(key).await,
            Self::Redis(store) => store.exists(key).await,
            Self::Memcached(store) => store.exists(key).await,
            Self::Badger(store) => store.exists(key).await,
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        match self {
            Self::Lightning(store) => store.keys(pattern).await,
            Self::Redis(store) => store.keys(pattern).await,
            Self::Memcached(store) => store.keys(pattern).await,
            Self::Badger(store) => store.keys(pattern).await,
        }
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        match self {
            Self::Lightning(store) => store.flush_all().await,
            Self::Redis(store) => store.flush_all().await,
            Self::Memcached(store) => store.flush_all().await,
            Self::Badger(store) => store.flush_all().await,
        }
    }

    async fn close(&self) -> Result<(), StoreError> {
        match self {
            Self::Lightning(store) => store.close().await,
            Self::Redis(store) => store.close().await,
            Self::Memcached(store) => store.close().await,
            Self::Badger(store) => store.close().await,
        }
    }

    async fn health_check(&self) -> Result<(), String> {
        match self {
            Self::Lightning(store) => store.health_check().await,
            Self::Redis(store) => store.health_check().await,
            Self::Memcached(store) => store.health_check().await,
            Self::Badger(store) => store.health_check().await,
        }
    }
}

/// Build the configured store.
///
/// The lightning backend may name another backend as its overflow target;
/// that backend is built first and handed to the lightning store.
pub async fn create_store(config: &StoreConfig) -> Result<Store, StoreError> {
    let store = match config.store_type {
        StoreType::Lightning => {
            let fallback = match config.lightning.fallback {
                Some(StoreType::Lightning) => {
                    return Err(StoreError::Config(
                        "lightning store cannot fall back to itself".to_string(),
                    ))
                }
                Some(ref fallback_type) => {
                    Some(Arc::new(create_remote_store(fallback_type, config).await?))
                }
                None => None,
            };
            Store::Lightning(lightning::LightningStore::new(&config.lightning, fallback))
        }
        ref remote => create_remote_store(remote, config).await?,
    };
    info!("Initialized '{}' key/value store", store.backend_name());
    Ok(store)
}

async fn create_remote_store(
    store_type: &StoreType,
    config: &StoreConfig,
) -> Result<Store, StoreError> {
    match store_type {
        StoreType::Redis => Ok(Store::Redis(
            redis::RedisStore::new(&config.redis, "redis").await?,
        )),
        StoreType::Dragonfly => Ok(Store::Redis(
            redis::RedisStore::new(&config.dragonfly, "dragonfly").await?,
        )),
        StoreType::Memcached => Ok(Store::Memcached(
            memcached::MemcachedStore::new(&config.memcached).await?,
        )),
        StoreType::Badger => Ok(Store::Badger(badger::BadgerStore::open(&config.badger)?)),
        StoreType::Lightning => Ok(Store::Lightning(lightning::LightningStore::new(
            &config.lightning,
            None,
        ))),
    }
}
