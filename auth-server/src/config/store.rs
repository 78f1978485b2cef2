use super::{duration, env_duration, EnvLookup};
use super::ConfigError;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Specifies which key/value store implementation to use
#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    Lightning,
    Redis,
    Dragonfly,
    Memcached,
    Badger,
}

impl FromStr for StoreType {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lightning" => Ok(Self::Lightning),
            "redis" => Ok(Self::Redis),
            "dragonfly" => Ok(Self::Dragonfly),
            "memcached" => Ok(Self::Memcached),
            "badger" => Ok(Self::Badger),
            other => Err(ConfigError::InvalidValue {
                name: "store type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lightning => "lightning",
            Self::Redis => "redis",
            Self::Dragonfly => "dragonfly",
            Self::Memcached => "memcached",
            Self::Badger => "badger",
        };
        f.write_str(name)
    }
}

/// Configuration for the key/value store shared by sessions and decisions
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend selected at boot (default: lightning)
    #[serde(rename = "type")]
    pub store_type: StoreType,
    pub lightning: LightningConfig,
    pub redis: RedisConfig,
    pub dragonfly: RedisConfig,
    pub memcached: MemcachedConfig,
    pub badger: BadgerConfig,
}

impl StoreConfig {
    pub fn from_env(config: &Self, lookup: &EnvLookup) -> Result<Self, ConfigError> {
        let mut result = config.clone();

        if let Some(store_type) = lookup("STORE_TYPE") {
            result.store_type = store_type.parse()?;
        }
        if let Some(address) = lookup("REDIS_ADDRESS") {
            result.redis.address = address;
        }
        if let Some(password) = lookup("REDIS_PASSWORD") {
            result.redis.password = password;
        }
        if let Some(address) = lookup("DRAGONFLY_ADDRESS") {
            result.dragonfly.address = address;
        }
        if let Some(address) = lookup("MEMCACHED_ADDRESS") {
            result.memcached.address = address;
        }
        if let Some(dir) = lookup("BADGER_DIR") {
            result.badger.dir = dir;
        }
        if let Some(interval) = env_duration(lookup, "LIGHTNING_CLEANUP_INTERVAL")? {
            result.lightning.cleanup_interval = interval;
        }

        Ok(result)
    }
}

/// In-process store options
#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct LightningConfig {
    pub initial_capacity: usize,
    /// Ceiling on live entries; zero disables the ceiling
    pub max_items: usize,
    /// Sweeper period; zero disables the sweeper
    #[serde(deserialize_with = "duration::deserialize")]
    pub cleanup_interval: Duration,
    /// Backend receiving writes once `max_items` is reached
    pub fallback: Option<StoreType>,
}

impl Default for LightningConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 1024,
            max_items: 100_000,
            cleanup_interval: Duration::from_secs(60),
            fallback: None,
        }
    }
}

/// Redis protocol options, used for both Redis and Dragonfly
#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct RedisConfig {
    /// `host:port`, with or without a `redis://` scheme
    pub address: String,
    pub password: String,
    pub db: i64,
    pub pool_size: usize,
    #[serde(deserialize_with = "duration::deserialize")]
    pub read_timeout: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub write_timeout: Duration,
    /// TTL applied when callers pass a zero TTL
    #[serde(deserialize_with = "duration::deserialize")]
    pub ttl: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            password: String::new(),
            db: 0,
            pool_size: 4,
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            ttl: Duration::ZERO,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct MemcachedConfig {
    /// `host:port` of the memcached server
    pub address: String,
    #[serde(deserialize_with = "duration::deserialize")]
    pub ttl: Duration,
}

/// Embedded file-backed store options
#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct BadgerConfig {
    pub dir: String,
    /// Flush to disk after every write
    pub sync_writes: bool,
    #[serde(deserialize_with = "duration::deserialize")]
    pub ttl: Duration,
}

impl Default for BadgerConfig {
    fn default() -> Self {
        Self {
            dir: "data/badger".to_string(),
            sync_writes: false,
            ttl: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::lookup_from;

    #[test]
    fn test_store_yaml_sections() {
        let yaml = r#"
type: dragonfly
lightning:
  maxItems: 10
  cleanupInterval: 30s
  fallback: redis
dragonfly:
  address: dragonfly:6379
  poolSize: 8
  readTimeout: 500ms
"#;
        let config: StoreConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.store_type, StoreType::Dragonfly);
        assert_eq!(config.lightning.max_items, 10);
        assert_eq!(config.lightning.cleanup_interval, Duration::from_secs(30));
        assert_eq!(config.lightning.fallback, Some(StoreType::Redis));
        assert_eq!(config.dragonfly.address, "dragonfly:6379");
        assert_eq!(config.dragonfly.pool_size, 8);
        assert_eq!(config.dragonfly.read_timeout, Duration::from_millis(500));
        // Untouched fields keep their defaults
        assert_eq!(config.dragonfly.write_timeout, Duration::from_secs(3));
        assert_eq!(config.badger.dir, "data/badger");
    }

    #[test]
    fn test_store_type_env_override() {
        let lookup = lookup_from(&[("STORE_TYPE", "Memcached"), ("MEMCACHED_ADDRESS", "mc:11211")]);
        let config = StoreConfig::from_env(&StoreConfig::default(), &lookup).unwrap();
        assert_eq!(config.store_type, StoreType::Memcached);
        assert_eq!(config.memcached.address, "mc:11211");
    }

    #[test]
    fn test_unknown_store_type_is_rejected() {
        let lookup = lookup_from(&[("STORE_TYPE", "etcd")]);
        let result = StoreConfig::from_env(&StoreConfig::default(), &lookup);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
