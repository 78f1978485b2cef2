use super::{KeyValueStore, StoreError, StoreValue};
use crate::config::MemcachedConfig;
use async_trait::async_trait;
use log::error;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Memcached treats expirations beyond this many seconds as unix timestamps
const MAX_RELATIVE_EXPIRATION: u64 = 30 * 24 * 60 * 60;

/// Memcached backend. The client is blocking, so every call runs on the
/// blocking pool. Memcached cannot enumerate keys, so `keys` is unsupported.
#[derive(Clone)]
pub struct MemcachedStore {
    client: Arc<memcache::Client>,
    default_ttl: Duration,
}

impl MemcachedStore {
    pub async fn new(config: &MemcachedConfig) -> Result<Self, StoreError> {
        if config.address.is_empty() {
            return Err(StoreError::Config(
                "An address is required for the memcached store".to_string(),
            ));
        }

        let url = connection_url(&config.address);
        let client = tokio::task::spawn_blocking(move || memcache::Client::connect(url))
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?
            .map_err(|err| {
                StoreError::Backend(format!("Failed to connect to memcached: {}", err))
            })?;

        Ok(Self {
            client: Arc::new(client),
            default_ttl: config.ttl,
        })
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&memcache::Client) -> Result<T, memcache::MemcacheError> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || f(&client))
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?
            .map_err(|err| {
                error!("memcached error while {}: {}", op, err);
                StoreError::Backend(err.to_string())
            })
    }
}

fn connection_url(address: &str) -> String {
    if address.starts_with("memcache://") {
        address.to_string()
    } else {
        format!("memcache://{}", address)
    }
}

/// Convert a TTL to memcached's expiration field. Zero means no expiry;
/// sub-second TTLs round up so the entry still expires.
fn expiration(ttl: Duration) -> u32 {
    if ttl.is_zero() {
        return 0;
    }
    let mut seconds = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        seconds += 1;
    }
    if seconds > MAX_RELATIVE_EXPIRATION {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        seconds += now;
    }
    u32::try_from(seconds).unwrap_or(u32::MAX)
}

#[async_trait]
impl KeyValueStore for MemcachedStore {
    async fn set(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        self.set_with_ttl(key, value, Duration::ZERO).await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: StoreValue,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let key = key.to_string();
        let bytes = value.into_bytes();
        let expires = expiration(ttl);
        self.run("setting", move |client| client.set(&key, &bytes[..], expires))
            .await
    }

    async fn get(&self, key: &str) -> Result<StoreValue, StoreError> {
        let key = key.to_string();
        let value = self
            .run("getting", move |client| client.get::<Vec<u8>>(&key))
            .await?;
        value.map(StoreValue::Bytes).ok_or(StoreError::KeyNotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        // `false` only means the key was already gone
        self.run("deleting", move |client| client.delete(&key))
            .await
            .map(|_| ())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        let value = self
            .run("checking", move |client| client.get::<Vec<u8>>(&key))
            .await?;
        Ok(value.is_some())
    }

    async fn keys(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unsupported("memcached"))
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.run("flushing", |client| client.flush()).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), String> {
        self.run("checking version", |client| client.version())
            .await
            .map(|_| ())
            .map_err(|err| format!("memcached health check failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_url() {
        assert_eq!(connection_url("localhost:11211"), "memcache://localhost:11211");
        assert_eq!(
            connection_url("memcache://cache:11211"),
            "memcache://cache:11211"
        );
    }

    #[test]
    fn test_expiration_conversion() {
        assert_eq!(expiration(Duration::ZERO), 0);
        assert_eq!(expiration(Duration::from_secs(60)), 60);
        assert_eq!(expiration(Duration::from_millis(1500)), 2);
        assert_eq!(expiration(Duration::from_millis(10)), 1);

        // Long TTLs become absolute timestamps
        let week = 7 * 24 * 60 * 60;
        assert_eq!(expiration(Duration::from_secs(week)), week as u32);
        let long = Duration::from_secs(MAX_RELATIVE_EXPIRATION + 1);
        assert!(u64::from(expiration(long)) > MAX_RELATIVE_EXPIRATION * 10);
    }

    #[tokio::test]
    async fn test_missing_address_is_config_error() {
        let result = MemcachedStore::new(&MemcachedConfig::default()).await;
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[tokio::test]
    #[ignore]
    async fn test_memcached_store_operations() {
        // Requires a memcached server on localhost:11211
        let store = MemcachedStore::new(&MemcachedConfig {
            address: "localhost:11211".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        store.set("mc_key", StoreValue::from("value")).await.unwrap();
        assert_eq!(store.get("mc_key").await.unwrap().into_bytes(), b"value");
        assert!(store.exists("mc_key").await.unwrap());
        store.delete("mc_key").await.unwrap();
        store.delete("mc_key").await.unwrap();
        assert!(!store.exists("mc_key").await.unwrap());
        assert!(matches!(
            store.keys("*").await,
            Err(StoreError::Unsupported("memcached"))
        ));
    }
}
