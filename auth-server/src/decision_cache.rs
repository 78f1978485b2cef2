use crate::store::{KeyValueStore, Store, StoreError, StoreValue};
use log::debug;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Decision not cached")]
    Miss,
    #[error("Store error: {0}")]
    Store(StoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::KeyNotFound => Self::Miss,
            other => Self::Store(other),
        }
    }
}

/// Percent-escapes the key separator and glob metacharacters, so every key
/// part is a single segment and distinct tuples never share a key.
fn escape(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' | ':' | '*' | '?' | '[' | ']' | '\\' => {
                escaped.push_str(&format!("%{:02X}", c as u32));
            }
            c => escaped.push(c),
        }
    }
    escaped
}

/// Key prefix isolating one account's decisions within one franchise
pub fn tenant_prefix(franchise_id: &str, account_id: &str) -> String {
    format!("authz:{}:{}", escape(franchise_id), escape(account_id))
}

/// Key suffix for one `(resource, action)` query. The request context is
/// folded into a digest in key order, so equal maps always hash alike.
pub fn postfix(resource: &str, action: &str, context: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in context {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{}:{}:{}", escape(resource), escape(action), &digest[..16])
}

/// Compressed, serialized decisions over the shared key/value store.
#[derive(Clone)]
pub struct DecisionCache {
    store: Arc<Store>,
}

impl DecisionCache {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn key(tenant: &str, postfix: &str) -> String {
        format!("{}:{}", tenant, postfix)
    }

    fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CacheError> {
        let serialized = serde_json::to_vec(message)?;
        Ok(zstd::encode_all(serialized.as_slice(), COMPRESSION_LEVEL)?)
    }

    fn decode<T: DeserializeOwned>(value: StoreValue) -> Result<T, CacheError> {
        let compressed = value.into_bytes();
        let serialized = zstd::decode_all(compressed.as_slice())?;
        Ok(serde_json::from_slice(&serialized)?)
    }

    pub async fn store_with_ttl<T: Serialize + Sync>(
        &self,
        tenant: &str,
        postfix: &str,
        message: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = Self::key(tenant, postfix);
        let encoded = Self::encode(message)?;
        debug!("Caching decision under {} ({} bytes)", key, encoded.len());
        self.store
            .set_with_ttl(&key, StoreValue::Bytes(encoded), ttl)
            .await?;
        Ok(())
    }

    /// Store without expiry
    pub async fn store<T: Serialize + Sync>(
        &self,
        tenant: &str,
        postfix: &str,
        message: &T,
    ) -> Result<(), CacheError> {
        let key = Self::key(tenant, postfix);
        let encoded = Self::encode(message)?;
        self.store.set(&key, StoreValue::Bytes(encoded)).await?;
        Ok(())
    }

    pub async fn check(&self, tenant: &str, postfix: &str) -> Result<bool, CacheError> {
        Ok(self.store.exists(&Self::key(tenant, postfix)).await?)
    }

    /// Returns [`CacheError::Miss`] when nothing is cached under the key
    pub async fn get<T: DeserializeOwned>(
        &self,
        tenant: &str,
        postfix: &str,
    ) -> Result<T, CacheError> {
        let value = self.store.get(&Self::key(tenant, postfix)).await?;
        Self::decode(value)
    }

    pub async fn delete(&self, tenant: &str, postfix: &str) -> Result<(), CacheError> {
        Ok(self.store.delete(&Self::key(tenant, postfix)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LightningConfig;
    use crate::store::lightning::LightningStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        allowed: bool,
        reason: String,
        issued_at: i64,
    }

    fn cache() -> (DecisionCache, Arc<Store>) {
        let store = Arc::new(Store::Lightning(LightningStore::new(
            &LightningConfig::default(),
            None,
        )));
        (DecisionCache::new(store.clone()), store)
    }

    fn record() -> Record {
        Record {
            allowed: true,
            reason: "allowed by role".to_string(),
            issued_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_key_composition() {
        assert_eq!(tenant_prefix("f1", "a1"), "authz:f1:a1");

        let empty = BTreeMap::new();
        let key = postfix("menu", "edit", &empty);
        assert!(key.starts_with("menu:edit:"));
        assert_eq!(key.len(), "menu:edit:".len() + 16);

        let mut first = BTreeMap::new();
        first.insert("ip".to_string(), "10.0.0.1".to_string());
        first.insert("device".to_string(), "pos".to_string());
        let mut second = BTreeMap::new();
        second.insert("device".to_string(), "pos".to_string());
        second.insert("ip".to_string(), "10.0.0.1".to_string());
        assert_eq!(postfix("menu", "edit", &first), postfix("menu", "edit", &second));
        assert_ne!(postfix("menu", "edit", &first), key);
    }

    #[test]
    fn test_separators_inside_parts_are_escaped() {
        assert_eq!(escape("orders:export"), "orders%3Aexport");
        assert_eq!(escape("50%*"), "50%25%2A");
        assert_eq!(tenant_prefix("f1:a1", "orders"), "authz:f1%3Aa1:orders");

        let empty = BTreeMap::new();
        let split_before = DecisionCache::key(
            &tenant_prefix("f1", "a1"),
            &postfix("orders:export", "run", &empty),
        );
        let split_after = DecisionCache::key(
            &tenant_prefix("f1", "a1"),
            &postfix("orders", "export:run", &empty),
        );
        let shifted_tenant = DecisionCache::key(
            &tenant_prefix("f1:a1", "orders"),
            &postfix("export", "run", &empty),
        );
        assert_ne!(split_before, split_after);
        assert_ne!(split_before, shifted_tenant);
        assert_ne!(split_after, shifted_tenant);
    }

    #[tokio::test]
    async fn test_store_then_get_returns_equal_message() {
        let (cache, _) = cache();
        let tenant = tenant_prefix("f1", "a1");
        let post = postfix("menu", "edit", &BTreeMap::new());

        cache
            .store_with_ttl(&tenant, &post, &record(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(cache.check(&tenant, &post).await.unwrap());
        let cached: Record = cache.get(&tenant, &post).await.unwrap();
        assert_eq!(cached, record());
    }

    #[tokio::test]
    async fn test_payload_is_compressed() {
        let (cache, store) = cache();
        cache.store("t", "p", &record()).await.unwrap();

        let raw = store.get("t:p").await.unwrap().into_bytes();
        // zstd frame magic number
        assert_eq!(&raw[..4], &[0x28, 0xB5, 0x2F, 0xFD]);
    }

    #[tokio::test]
    async fn test_missing_and_deleted_entries() {
        let (cache, _) = cache();
        assert!(matches!(
            cache.get::<Record>("t", "missing").await,
            Err(CacheError::Miss)
        ));

        cache.store("t", "p", &record()).await.unwrap();
        cache.delete("t", "p").await.unwrap();
        cache.delete("t", "p").await.unwrap();
        assert!(!cache.check("t", "p").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_an_error() {
        let (cache, store) = cache();
        store.set("t:p", StoreValue::from("not zstd")).await.unwrap();
        assert!(matches!(
            cache.get::<Record>("t", "p").await,
            Err(CacheError::Compression(_))
        ));
    }
}
