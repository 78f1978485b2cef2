use super::pattern::glob_match;
use super::{KeyValueStore, StoreError, StoreValue};
use crate::config::BadgerConfig;
use async_trait::async_trait;
use log::{error, info};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Value layout: 8-byte big-endian expiry in unix millis (0 = none), one
/// shape byte, then the payload.
const HEADER_LEN: usize = 9;
const SHAPE_BYTES: u8 = 0;
const SHAPE_TEXT: u8 = 1;

/// Embedded file-backed store persisted under the configured directory.
#[derive(Clone)]
pub struct BadgerStore {
    db: sled::Db,
    sync_writes: bool,
    default_ttl: Duration,
}

impl BadgerStore {
    pub fn open(config: &BadgerConfig) -> Result<Self, StoreError> {
        if config.dir.is_empty() {
            return Err(StoreError::Config(
                "A directory is required for the badger store".to_string(),
            ));
        }
        let db = sled::open(&config.dir).map_err(|err| {
            StoreError::Backend(format!("Failed to open store at {}: {}", config.dir, err))
        })?;
        info!("Opened embedded store at {}", config.dir);
        Ok(Self {
            db,
            sync_writes: config.sync_writes,
            default_ttl: config.ttl,
        })
    }

    async fn sync(&self) -> Result<(), StoreError> {
        if self.sync_writes {
            self.db.flush_async().await.map_err(backend_error)?;
        }
        Ok(())
    }

    /// Decode a stored record, dropping it when expired
    fn live_value(&self, key: &str, raw: &[u8]) -> Result<Option<StoreValue>, StoreError> {
        let (expires_at, value) = decode(raw)?;
        if expires_at != 0 && expires_at <= now_millis() {
            self.db.remove(key).map_err(backend_error)?;
            return Ok(None);
        }
        Ok(Some(value))
    }
}

fn backend_error(err: sled::Error) -> StoreError {
    error!("Embedded store error: {}", err);
    StoreError::Backend(err.to_string())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

fn encode(value: StoreValue, ttl: Duration) -> Vec<u8> {
    let expires_at = if ttl.is_zero() {
        0
    } else {
        now_millis().saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
    };
    let (shape, payload) = match value {
        StoreValue::Bytes(bytes) => (SHAPE_BYTES, bytes),
        StoreValue::Text(text) => (SHAPE_TEXT, text.into_bytes()),
    };
    let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
    record.extend_from_slice(&expires_at.to_be_bytes());
    record.push(shape);
    record.extend_from_slice(&payload);
    record
}

fn decode(record: &[u8]) -> Result<(u64, StoreValue), StoreError> {
    if record.len() < HEADER_LEN {
        return Err(StoreError::Backend("Corrupt record header".to_string()));
    }
    let mut expiry = [0u8; 8];
    expiry.copy_from_slice(&record[..8]);
    let payload = record[HEADER_LEN..].to_vec();
    let value = match record[8] {
        SHAPE_TEXT => match String::from_utf8(payload) {
            Ok(text) => StoreValue::Text(text),
            Err(err) => StoreValue::Bytes(err.into_bytes()),
        },
        _ => StoreValue::Bytes(payload),
    };
    Ok((u64::from_be_bytes(expiry), value))
}

#[async_trait]
impl KeyValueStore for BadgerStore {
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
        self.db
            .insert(key, encode(value, ttl))
            .map_err(backend_error)?;
        self.sync().await
    }

    async fn get(&self, key: &str) -> Result<StoreValue, StoreError> {
        let raw = self
            .db
            .get(key)
            .map_err(backend_error)?
            .ok_or(StoreError::KeyNotFound)?;
        self.live_value(key, &raw)?.ok_or(StoreError::KeyNotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db.remove(key).map_err(backend_error)?;
        self.sync().await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self.db.get(key).map_err(backend_error)? {
            Some(raw) => Ok(self.live_value(key, &raw)?.is_some()),
            None => Ok(false),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = now_millis();
        let mut keys = Vec::new();
        for item in self.db.iter() {
            let (key, raw) = item.map_err(backend_error)?;
            let (expires_at, _) = decode(&raw)?;
            if expires_at != 0 && expires_at <= now {
                continue;
            }
            let key = String::from_utf8_lossy(&key).into_owned();
            if glob_match(pattern, &key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.db.clear().map_err(backend_error)?;
        self.sync().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.db.flush_async().await.map_err(backend_error)?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), String> {
        self.db
            .size_on_disk()
            .map(|_| ())
            .map_err(|err| format!("Embedded store health check failed: {}", err))
    }
}
