use super::{duration, env_duration, ConfigError, EnvLookup};
use serde::Deserialize;
use std::time::Duration;

/// Specifies which policy evaluator answers access decisions
#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyEngine {
    /// In-process rule set
    #[default]
    Builtin,
    /// Remote Open Policy Agent
    Opa,
}

/// Configuration for the policy evaluator
#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyConfig {
    pub engine: PolicyEngine,
    /// Base URL of the OPA server (default: http://localhost:8181)
    pub opa_url: String,
    /// Package path queried under `/v1/data/`
    pub opa_path: String,
    #[serde(deserialize_with = "duration::deserialize")]
    pub query_timeout: Duration,
    /// Version tag reported by the builtin engine and as the OPA fallback
    pub version: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            engine: PolicyEngine::Builtin,
            opa_url: "http://localhost:8181".to_string(),
            opa_path: "franchise/authz".to_string(),
            query_timeout: Duration::from_secs(1),
            version: "builtin-v1".to_string(),
        }
    }
}

impl PolicyConfig {
    pub fn from_env(config: &Self, lookup: &EnvLookup) -> Result<Self, ConfigError> {
        let mut result = config.clone();

        result.engine = match lookup("POLICY_ENGINE").as_deref() {
            Some("builtin") => PolicyEngine::Builtin,
            Some("opa") => PolicyEngine::Opa,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "policy engine",
                    value: other.to_string(),
                })
            }
            None => result.engine,
        };
        if let Some(url) = lookup("OPA_URL") {
            result.opa_url = url;
        }
        if let Some(timeout) = env_duration(lookup, "OPA_QUERY_TIMEOUT")? {
            result.query_timeout = timeout;
        }

        Ok(result)
    }
}

/// Decision cache options
#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct DecisionConfig {
    /// Lifetime of a cached decision and the span between `issuedAt` and `expiresAt`
    #[serde(deserialize_with = "duration::deserialize")]
    pub ttl: Duration,
    pub cache_enabled: bool,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            cache_enabled: true,
        }
    }
}

impl DecisionConfig {
    pub fn from_env(config: &Self, lookup: &EnvLookup) -> Result<Self, ConfigError> {
        let mut result = config.clone();

        if let Some(ttl) = env_duration(lookup, "DECISION_TTL")? {
            result.ttl = ttl;
        }
        if let Some(enabled) = lookup("DECISION_CACHE_ENABLED") {
            result.cache_enabled = enabled.eq_ignore_ascii_case("true") || enabled == "1";
        }

        Ok(result)
    }

    /// Decisions carry whole-second timestamps, so anything shorter would be
    /// cached with no usable expiry
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl < Duration::from_secs(1) {
            return Err(ConfigError::InvalidValue {
                name: "decision.ttl",
                value: humantime::format_duration(self.ttl).to_string(),
            });
        }
        Ok(())
    }
}
