pub use crate::config::jwt::{JwtConfig, JwtHeaderConfig};
pub use crate::config::policy::{DecisionConfig, PolicyConfig, PolicyEngine};
pub use crate::config::store::{
    BadgerConfig, LightningConfig, MemcachedConfig, RedisConfig, StoreConfig, StoreType,
};
use crate::resolver::AccountStatus;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub mod jwt;
pub mod policy;
pub mod store;

/// Reads a single environment variable; injected so overrides can be tested
/// without touching the process environment.
pub type EnvLookup = dyn Fn(&str) -> Option<String>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid duration in {name}: {value}")]
    Duration { name: String, value: String },
    #[error("Invalid {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Main configuration structure for the auth server
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    pub store: StoreConfig,
    pub decision: DecisionConfig,
    pub policy: PolicyConfig,
    pub database: DatabaseConfig,
    pub interceptor: InterceptorConfig,
    pub access: AccessConfig,
}

impl AppConfig {
    /// Load `config/<APP_ENV>.yaml` (when present) and apply environment
    /// overrides on top of it.
    pub fn load() -> Result<Self, ConfigError> {
        let app_env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let path = PathBuf::from("config").join(format!("{}.yaml", app_env));
        let base = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        let config = Self::from_env(&base, &process_env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Apply environment variable overrides to every section
    pub fn from_env(config: &Self, lookup: &EnvLookup) -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::from_env(&config.server, lookup)?,
            jwt: JwtConfig::from_env(&config.jwt, lookup)?,
            store: StoreConfig::from_env(&config.store, lookup)?,
            decision: DecisionConfig::from_env(&config.decision, lookup)?,
            policy: PolicyConfig::from_env(&config.policy, lookup)?,
            database: DatabaseConfig::from_env(&config.database, lookup)?,
            interceptor: InterceptorConfig::from_env(&config.interceptor, lookup)?,
            access: AccessConfig::from_env(&config.access, lookup)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.jwt.validate()?;
        self.access.validate()?;
        self.decision.validate()?;
        if self.store.lightning.fallback == Some(StoreType::Lightning) {
            return Err(ConfigError::InvalidValue {
                name: "store.lightning.fallback",
                value: StoreType::Lightning.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// The port the server listens on (default: 8080)
    pub port: u16,
    /// Deployment environment name
    pub env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            env: "development".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env(config: &Self, lookup: &EnvLookup) -> Result<Self, ConfigError> {
        let mut result = config.clone();

        if let Some(port) = lookup("PORT") {
            result.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                name: "PORT",
                value: port.clone(),
            })?;
        }
        if let Some(env) = lookup("ENV") {
            result.env = env;
        }

        Ok(result)
    }
}

/// Relational subject store options
#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Postgres connection URL; empty selects the in-memory resolver
    pub url: String,
    pub max_connections: u32,
    #[serde(deserialize_with = "duration::deserialize")]
    pub acquire_timeout: Duration,
    pub schema: String,
    /// YAML subjects loaded into the in-memory resolver when `url` is empty
    pub seed_file: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            schema: "public".to_string(),
            seed_file: String::new(),
        }
    }
}

impl DatabaseConfig {
    pub fn from_env(config: &Self, lookup: &EnvLookup) -> Result<Self, ConfigError> {
        let mut result = config.clone();

        if let Some(url) = lookup("DATABASE_URL") {
            result.url = url;
        }
        if let Some(seed_file) = lookup("SUBJECT_SEED_FILE") {
            result.seed_file = seed_file;
        }

        Ok(result)
    }
}

/// Bearer token verification options for guarded routes
#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct InterceptorConfig {
    /// JWKS endpoint; empty verifies against the local key pair
    pub jwks_url: String,
    #[serde(deserialize_with = "duration::deserialize")]
    pub refresh_interval: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub fetch_timeout: Duration,
    /// How long a key set keeps serving after refreshes start failing
    #[serde(deserialize_with = "duration::deserialize")]
    pub stale_ttl: Duration,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            jwks_url: String::new(),
            refresh_interval: Duration::from_secs(10 * 60),
            fetch_timeout: Duration::from_secs(5),
            stale_ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl InterceptorConfig {
    pub fn from_env(config: &Self, lookup: &EnvLookup) -> Result<Self, ConfigError> {
        let mut result = config.clone();

        if let Some(url) = lookup("JWKS_URL") {
            result.jwks_url = url;
        }
        if let Some(interval) = env_duration(lookup, "JWKS_REFRESH_INTERVAL")? {
            result.refresh_interval = interval;
        }

        Ok(result)
    }
}

/// Allowlists applied at login
#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct AccessConfig {
    /// Account types allowed to log in; empty allows every type
    pub allowed_roles: Vec<String>,
    /// Account statuses recognized by this deployment
    pub allowed_statuses: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            allowed_roles: Vec::new(),
            allowed_statuses: ["active", "inactive", "suspended", "blocked", "limited"]
                .iter()
                .map(|status| status.to_string())
                .collect(),
        }
    }
}

impl AccessConfig {
    pub fn from_env(config: &Self, lookup: &EnvLookup) -> Result<Self, ConfigError> {
        let mut result = config.clone();

        if let Some(roles) = lookup("ALLOWED_ROLES") {
            result.allowed_roles = split_list(&roles);
        }
        if let Some(statuses) = lookup("ALLOWED_STATUSES") {
            result.allowed_statuses = split_list(&statuses);
        }

        Ok(result)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for status in &self.allowed_statuses {
            if status.parse::<AccountStatus>().is_err() {
                return Err(ConfigError::InvalidValue {
                    name: "allowed status",
                    value: status.clone(),
                });
            }
        }
        Ok(())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

pub(crate) fn env_duration(lookup: &EnvLookup, name: &str) -> Result<Option<Duration>, ConfigError> {
    match lookup(name) {
        Some(value) => duration::parse(&value)
            .map(Some)
            .map_err(|_| ConfigError::Duration {
                name: name.to_string(),
                value,
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
pub(crate) fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: std::collections::HashMap<String, String> = pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    move |name: &str| vars.get(name).cloned()
}

/// Durations are written as humantime strings (`30s`, `10m`, `7d`) or bare
/// integer seconds.
pub(crate) mod duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn parse(value: &str) -> Result<Duration, humantime::DurationError> {
        let value = value.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            return Ok(Duration::from_secs(seconds));
        }
        humantime::parse_duration(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(seconds) => Ok(Duration::from_secs(seconds)),
            Raw::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.store.store_type, StoreType::Lightning);
        assert_eq!(config.jwt.access_token_ttl, Duration::from_secs(86_400));
        assert_eq!(config.jwt.refresh_token_ttl, Duration::from_secs(604_800));
        assert_eq!(config.policy.engine, PolicyEngine::Builtin);
        assert_eq!(config.interceptor.refresh_interval, Duration::from_secs(600));
        assert!(config.decision.cache_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_with_env_overrides() {
        let yaml = r#"
server:
  port: 9000
  env: staging
jwt:
  issuer: auth.staging
  accessTokenTtl: 1h
store:
  type: redis
  redis:
    address: localhost:6379
decision:
  ttl: 30
"#;
        let base = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(base.server.port, 9000);
        assert_eq!(base.jwt.access_token_ttl, Duration::from_secs(3600));
        assert_eq!(base.decision.ttl, Duration::from_secs(30));

        let lookup = lookup_from(&[
            ("STORE_TYPE", "lightning"),
            ("DATABASE_URL", "postgres://localhost/franchise"),
            ("ALLOWED_ROLES", "Admin, employee ,"),
        ]);
        let config = AppConfig::from_env(&base, &lookup).unwrap();
        assert_eq!(config.store.store_type, StoreType::Lightning);
        assert_eq!(config.store.redis.address, "localhost:6379");
        assert_eq!(config.database.url, "postgres://localhost/franchise");
        assert_eq!(config.access.allowed_roles, vec!["admin", "employee"]);
        assert_eq!(config.jwt.issuer, "auth.staging");
    }

    #[test]
    fn test_unknown_allowed_status_fails_validation() {
        let lookup = lookup_from(&[("ALLOWED_STATUSES", "active,retired")]);
        let config = AppConfig::from_env(&AppConfig::default(), &lookup).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { value, .. }) if value == "retired"
        ));
    }

    #[test]
    fn test_zero_decision_ttl_fails_validation() {
        let config = AppConfig::from_yaml("decision:\n  ttl: 0s\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { name: "decision.ttl", value }) if value == "0s"
        ));
    }

    #[test]
    fn test_malformed_yaml_duration() {
        let result = AppConfig::from_yaml("decision:\n  ttl: soon\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_shipped_development_config() {
        let config = AppConfig::from_file(Path::new("config/development.yaml")).unwrap();
        assert_eq!(config.jwt.header.key_id, "franchise-auth-dev");
        assert_eq!(config.jwt.refresh_token_ttl, Duration::from_secs(7 * 24 * 60 * 60));
        assert_eq!(config.decision.ttl, Duration::from_secs(60));
        assert!(config.database.url.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = AppConfig::from_file(Path::new("/nonexistent/franchise-auth.yaml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
