use crate::config::{InterceptorConfig, JwtConfig};
use crate::keys::{parse_algorithm, KeyFamily, KeyMaterial};
use crate::token::{AuthClaims, TokenType};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::Validation;
use log::info;
use std::sync::Arc;
use thiserror::Error;

pub mod jwks;

pub use jwks::{spawn_refresher, JwksCache};

#[derive(Debug, Error)]
pub enum InterceptorError {
    #[error("Missing Authorization header")]
    MissingHeader,
    #[error("Authorization header is not a bearer token")]
    MalformedHeader,
    #[error("No verification key for kid {0:?}")]
    UnknownKey(String),
    #[error("unexpected signing method: {0}")]
    UnexpectedAlgorithm(String),
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token: {0}")]
    Invalid(String),
    #[error("Verification keys are unavailable")]
    KeysUnavailable,
    #[error("Failed to fetch JWKS: {0}")]
    Fetch(String),
}

/// Claims of a verified bearer token, stored in request extensions by the
/// authentication middleware
#[derive(Debug, Clone)]
pub struct VerifiedClaims(pub AuthClaims);

/// Verifies bearer access tokens against a memoized JWKS.
pub struct AuthInterceptor {
    keys: Arc<JwksCache>,
    family: KeyFamily,
    issuer: String,
    audience: String,
}

impl AuthInterceptor {
    pub fn new(keys: Arc<JwksCache>, jwt: &JwtConfig) -> Result<Self, InterceptorError> {
        let alg = parse_algorithm(&jwt.header.alg)
            .map_err(|err| InterceptorError::UnexpectedAlgorithm(err.to_string()))?;
        let family = KeyFamily::of(alg)
            .ok_or_else(|| InterceptorError::UnexpectedAlgorithm(jwt.header.alg.clone()))?;
        Ok(Self {
            keys,
            family,
            issuer: jwt.issuer.clone(),
            audience: jwt.audience.clone(),
        })
    }

    /// Remote JWKS when one is configured, the local key pair otherwise.
    /// The first remote fetch happens here so startup fails early.
    pub async fn from_config(
        config: &InterceptorConfig,
        jwt: &JwtConfig,
        material: Arc<KeyMaterial>,
    ) -> Result<Self, InterceptorError> {
        let cache = if config.jwks_url.is_empty() {
            JwksCache::local(material)
        } else {
            let cache = JwksCache::remote(&config.jwks_url, config.fetch_timeout, config.stale_ttl)?;
            let loaded = cache.refresh().await?;
            info!("Loaded {} verification keys from {}", loaded, config.jwks_url);
            cache
        };
        Self::new(Arc::new(cache), jwt)
    }

    pub fn keys(&self) -> Arc<JwksCache> {
        Arc::clone(&self.keys)
    }

    /// Verify the raw `Authorization` header value
    pub fn authenticate(&self, header: Option<&str>) -> Result<AuthClaims, InterceptorError> {
        let header = header.ok_or(InterceptorError::MissingHeader)?;
        let token = bearer_token(header)?;
        self.verify(token)
    }

    pub fn verify(&self, token: &str) -> Result<AuthClaims, InterceptorError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|err| InterceptorError::Invalid(err.to_string()))?;
        if KeyFamily::of(header.alg) != Some(self.family) {
            return Err(InterceptorError::UnexpectedAlgorithm(format!("{:?}", header.alg)));
        }
        let kid = header.kid.unwrap_or_default();
        let (alg, key) = self.keys.key(&kid)?;
        if alg != header.alg {
            return Err(InterceptorError::UnexpectedAlgorithm(format!("{:?}", header.alg)));
        }

        let mut validation = Validation::new(alg);
        validation.leeway = 0;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iat", "sub", "iss", "aud"]);

        let claims = jsonwebtoken::decode::<AuthClaims>(token, &key, &validation)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => InterceptorError::Expired,
                _ => InterceptorError::Invalid(err.to_string()),
            })?
            .claims;
        if claims.token_type != TokenType::Access {
            return Err(InterceptorError::Invalid("not an access token".to_string()));
        }
        Ok(claims)
    }
}

/// Strip a case-insensitive `Bearer ` prefix
pub fn bearer_token(header: &str) -> Result<&str, InterceptorError> {
    let (scheme, token) = header
        .split_once(' ')
        .ok_or(InterceptorError::MalformedHeader)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(InterceptorError::MalformedHeader);
    }
    Ok(token)
}
