use super::pattern::glob_match;
use super::{KeyValueStore, Store, StoreError, StoreValue};
use crate::config::LightningConfig;
use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

struct Entry {
    value: StoreValue,
    /// `None` means the entry never expires
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Inner {
    entries: RwLock<HashMap<String, Entry>>,
    max_items: usize,
    fallback: Option<Arc<Store>>,
    hits: AtomicU64,
    misses: AtomicU64,
    shutdown: CancellationToken,
}

/// Point-in-time counters of a lightning store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub items: usize,
}

/// In-process key/value store.
///
/// Expired entries are hidden from readers immediately and physically removed
/// either by a follow-up task spawned on read or by the periodic sweeper.
/// With a nonzero `max_items`, inserts of new keys beyond the ceiling go to the
/// fallback store when one is configured and fail otherwise.
#[derive(Clone)]
pub struct LightningStore {
    inner: Arc<Inner>,
}

impl LightningStore {
    pub fn new(config: &LightningConfig, fallback: Option<Arc<Store>>) -> Self {
        let inner = Arc::new(Inner {
            entries: RwLock::new(HashMap::with_capacity(config.initial_capacity)),
            max_items: config.max_items,
            fallback,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        if !config.cleanup_interval.is_zero() {
            spawn_sweeper(
                Arc::downgrade(&inner),
                inner.shutdown.clone(),
                config.cleanup_interval,
            );
        }

        Self { inner }
    }

    pub async fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            items: self.inner.entries.read().await.len(),
        }
    }

    async fn insert(
        &self,
        key: &str,
        value: StoreValue,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let expires_at = ttl.filter(|ttl| !ttl.is_zero()).map(|ttl| Instant::now() + ttl);
        {
            let mut entries = self.inner.entries.write().await;
            let at_capacity = self.inner.max_items > 0
                && entries.len() >= self.inner.max_items
                && !entries.contains_key(key);
            if !at_capacity {
                entries.insert(key.to_string(), Entry { value, expires_at });
                return Ok(());
            }
        }

        match &self.inner.fallback {
            Some(fallback) => {
                debug!("Lightning store full, writing key to fallback store");
                match ttl {
                    Some(ttl) => fallback.set_with_ttl(key, value, ttl).await,
                    None => fallback.set(key, value).await,
                }
            }
            None => Err(StoreError::CapacityReached(self.inner.max_items)),
        }
    }

    /// Remove `key` if it is still expired once the write lock is held
    fn schedule_expired_delete(&self, key: &str) {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            let mut entries = inner.entries.write().await;
            if entries
                .get(&key)
                .is_some_and(|entry| entry.is_expired(Instant::now()))
            {
                entries.remove(&key);
            }
        });
    }
}

fn spawn_sweeper(inner: Weak<Inner>, shutdown: CancellationToken, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Lightning store sweeper received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    let now = Instant::now();
                    let mut entries = inner.entries.write().await;
                    let before = entries.len();
                    entries.retain(|_, entry| !entry.is_expired(now));
                    let removed = before - entries.len();
                    if removed > 0 {
                        debug!("Lightning store sweeper removed {} expired entries", removed);
                    }
                }
            }
        }
    });
}

#[async_trait]
impl KeyValueStore for LightningStore {
    async fn set(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        self.insert(key, value, None).await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: StoreValue,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.insert(key, value, Some(ttl)).await
    }

    async fn get(&self, key: &str) -> Result<StoreValue, StoreError> {
        let expired = {
            let entries = self.inner.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(Instant::now()) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.value.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            self.schedule_expired_delete(key);
        } else if let Some(fallback) = &self.inner.fallback {
            match fallback.get(key).await {
                Ok(value) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(StoreError::KeyNotFound) => {}
                Err(err) => warn!("Fallback store read failed: {}", err),
            }
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        Err(StoreError::KeyNotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.entries.write().await.remove(key);
        if let Some(fallback) = &self.inner.fallback {
            fallback.delete(key).await?;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let present = self
            .inner
            .entries
            .read()
            .await
            .get(key)
            .is_some_and(|entry| !entry.is_expired(Instant::now()));
        if present {
            return Ok(true);
        }
        match &self.inner.fallback {
            Some(fallback) => fallback.exists(key).await,
            None => Ok(false),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .inner
            .entries
            .read()
            .await
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();

        if let Some(fallback) = &self.inner.fallback {
            match fallback.keys(pattern).await {
                Ok(remote) => keys.extend(remote),
                Err(StoreError::Unsupported(backend)) => {
                    debug!("Fallback store '{}' cannot list keys", backend)
                }
                Err(err) => return Err(err),
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.inner.entries.write().await.clear();
        if let Some(fallback) = &self.inner.fallback {
            fallback.flush_all().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.shutdown.cancel();
        if let Some(fallback) = &self.inner.fallback {
            fallback.close().await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), String> {
        if self.inner.shutdown.is_cancelled() {
            return Err("lightning store is closed".to_string());
        }
        match &self.inner.fallback {
            Some(fallback) => fallback.health_check().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_items: usize, cleanup_interval: Duration) -> LightningConfig {
        LightningConfig {
            initial_capacity: 16,
            max_items,
            cleanup_interval,
            fallback: None,
        }
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = LightningStore::new(&config(0, Duration::from_secs(60)), None);

        store.set("a", StoreValue::from("1")).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), StoreValue::from("1"));
        assert!(store.exists("a").await.unwrap());

        store.delete("a").await.unwrap();
        // Deleting twice is fine
        store.delete("a").await.unwrap();
        assert!(matches!(store.get("a").await, Err(StoreError::KeyNotFound)));
        assert!(!store.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_lazy_on_read() {
        // Sweeper disabled; expiry must still be observed by readers
        let store = LightningStore::new(&config(0, Duration::ZERO), None);
        store
            .set_with_ttl("short", StoreValue::from("v"), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(store.exists("short").await.unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!store.exists("short").await.unwrap());
        assert!(matches!(
            store.get("short").await,
            Err(StoreError::KeyNotFound)
        ));

        // The scheduled delete eventually removes the entry
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.stats().await.items, 0);
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let store = LightningStore::new(&config(0, Duration::from_millis(50)), None);
        store
            .set_with_ttl("k1", StoreValue::from("v"), Duration::from_millis(20))
            .await
            .unwrap();
        store.set("k2", StoreValue::from("v")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = store.stats().await;
        assert_eq!(stats.items, 1);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_ttl_means_no_expiry() {
        let store = LightningStore::new(&config(0, Duration::ZERO), None);
        store
            .set_with_ttl("k", StoreValue::from("v"), Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity_rejects_new_keys() {
        let store = LightningStore::new(&config(2, Duration::ZERO), None);
        store.set("a", StoreValue::from("1")).await.unwrap();
        store.set("b", StoreValue::from("2")).await.unwrap();

        let result = store.set("c", StoreValue::from("3")).await;
        assert!(matches!(result, Err(StoreError::CapacityReached(2))));

        // Overwriting an existing key is still allowed
        store.set("a", StoreValue::from("10")).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), StoreValue::from("10"));
    }

    #[tokio::test]
    async fn test_capacity_overflow_goes_to_fallback() {
        let fallback = Arc::new(Store::Lightning(LightningStore::new(
            &config(0, Duration::ZERO),
            None,
        )));
        let store = LightningStore::new(&config(1, Duration::ZERO), Some(fallback.clone()));

        store.set("a", StoreValue::from("1")).await.unwrap();
        store.set("b", StoreValue::from("2")).await.unwrap();

        assert_eq!(fallback.get("b").await.unwrap(), StoreValue::from("2"));
        assert_eq!(store.get("b").await.unwrap(), StoreValue::from("2"));
        assert_eq!(store.keys("*").await.unwrap(), vec!["a", "b"]);

        store.delete("b").await.unwrap();
        assert!(!fallback.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_pattern_and_flush() {
        let store = LightningStore::new(&config(0, Duration::ZERO), None);
        store.set("a1:access_token", StoreValue::from("x")).await.unwrap();
        store.set("a1:refresh_token", StoreValue::from("y")).await.unwrap();
        store.set("a2:refresh_token", StoreValue::from("z")).await.unwrap();

        assert_eq!(
            store.keys("a1:*").await.unwrap(),
            vec!["a1:access_token", "a1:refresh_token"]
        );
        assert_eq!(store.keys("*:refresh_token").await.unwrap().len(), 2);

        store.flush_all().await.unwrap();
        assert!(store.keys("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hit_and_miss_counters() {
        let store = LightningStore::new(&config(0, Duration::ZERO), None);
        store.set("a", StoreValue::from("1")).await.unwrap();
        let _ = store.get("a").await;
        let _ = store.get("a").await;
        let _ = store.get("missing").await;

        let stats = store.stats().await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.items, 1);
    }

    #[tokio::test]
    async fn test_closed_store_is_unhealthy() {
        let store = LightningStore::new(&config(0, Duration::from_secs(1)), None);
        assert!(store.health_check().await.is_ok());
        store.close().await.unwrap();
        assert!(store.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_operations() {
        let store = LightningStore::new(&config(0, Duration::from_millis(10)), None);
        let writer = store.clone();

        let set_task = tokio::spawn(async move {
            for i in 0..100 {
                writer
                    .set_with_ttl(
                        &format!("key_{i}"),
                        StoreValue::from(format!("value_{i}")),
                        Duration::from_secs(60),
                    )
                    .await
                    .expect("Failed to set value");
            }
        });

        let reader = store.clone();
        let get_task = tokio::spawn(async move {
            for i in 0..100 {
                if let Ok(value) = reader.get(&format!("key_{i}")).await {
                    assert_eq!(value, StoreValue::from(format!("value_{i}")));
                }
            }
        });

        tokio::try_join!(set_task, get_task).expect("Tasks failed");
        assert_eq!(store.stats().await.items, 100);
    }
}
