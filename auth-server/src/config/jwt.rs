use super::{duration, env_duration, ConfigError, EnvLookup};
use serde::Deserialize;
use std::time::Duration;

/// Header fields stamped on every minted token
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JwtHeaderConfig {
    /// Asymmetric signing algorithm (RS256, RS384, RS512, PS256, PS384, PS512 or ES256)
    pub alg: String,
    pub typ: String,
    #[serde(rename = "keyID")]
    pub key_id: String,
    #[serde(rename = "use")]
    pub key_use: String,
}

impl Default for JwtHeaderConfig {
    fn default() -> Self {
        Self {
            alg: "RS256".to_string(),
            typ: "JWT".to_string(),
            key_id: "franchise-auth-1".to_string(),
            key_use: "sig".to_string(),
        }
    }
}

/// Token signing configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct JwtConfig {
    #[serde(alias = "jwtPrivateKeyPath")]
    pub private_key_path: String,
    #[serde(alias = "jwtPublicKeyPath")]
    pub public_key_path: String,
    #[serde(alias = "jwtHeader")]
    pub header: JwtHeaderConfig,
    pub issuer: String,
    pub audience: String,
    /// Access token lifetime (default: 24h)
    #[serde(deserialize_with = "duration::deserialize")]
    pub access_token_ttl: Duration,
    /// Refresh token lifetime (default: 7d)
    #[serde(deserialize_with = "duration::deserialize")]
    pub refresh_token_ttl: Duration,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            private_key_path: "keys/private.pem".to_string(),
            public_key_path: "keys/public.pem".to_string(),
            header: JwtHeaderConfig::default(),
            issuer: "franchise-auth".to_string(),
            audience: "franchise-services".to_string(),
            access_token_ttl: Duration::from_secs(24 * 60 * 60),
            refresh_token_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl JwtConfig {
    pub fn from_env(config: &Self, lookup: &EnvLookup) -> Result<Self, ConfigError> {
        let mut result = config.clone();

        if let Some(ttl) = env_duration(lookup, "ACCESS_TOKEN_TTL")? {
            result.access_token_ttl = ttl;
        }
        if let Some(ttl) = env_duration(lookup, "REFRESH_TOKEN_TTL")? {
            result.refresh_token_ttl = ttl;
        }
        if let Some(issuer) = lookup("JWT_ISSUER") {
            result.issuer = issuer;
        }
        if let Some(audience) = lookup("JWT_AUDIENCE") {
            result.audience = audience;
        }
        if let Some(path) = lookup("JWT_PRIVATE_KEY_PATH") {
            result.private_key_path = path;
        }
        if let Some(path) = lookup("JWT_PUBLIC_KEY_PATH") {
            result.public_key_path = path;
        }

        Ok(result)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        // Published keys only ever verify signatures
        if self.header.key_use != "sig" {
            return Err(ConfigError::InvalidValue {
                name: "jwtHeader.use",
                value: self.header.key_use.clone(),
            });
        }
        if self.access_token_ttl.is_zero() || self.refresh_token_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "token ttl",
                value: "0s".to_string(),
            });
        }
        // A refresh token must outlive the access token it renews
        if self.refresh_token_ttl <= self.access_token_ttl {
            return Err(ConfigError::InvalidValue {
                name: "refreshTokenTtl",
                value: humantime::format_duration(self.refresh_token_ttl).to_string(),
            });
        }
        Ok(())
    }
}
