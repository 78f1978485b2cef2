use crate::config::JwtConfig;
use crate::keys::{parse_algorithm, KeyError, KeyMaterial};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("{0} is required")]
    InputMissing(&'static str),
    #[error("Token lifetime must be at least one second")]
    InvalidTtl,
    #[error("unexpected signing method: {0}")]
    UnexpectedSigningMethod(String),
    #[error("Token has expired")]
    Expired,
    #[error("Expected a {expected} token")]
    WrongTokenType { expected: TokenType },
    #[error("Invalid token: {0}")]
    Invalid(String),
    #[error("Failed to sign token: {0}")]
    Signing(String),
    #[error("Signing key mismatch: {0}")]
    Config(String),
}

impl From<KeyError> for TokenError {
    fn from(err: KeyError) -> Self {
        Self::Signing(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Access => f.write_str("access"),
            Self::Refresh => f.write_str("refresh"),
        }
    }
}

/// Identity assertion carried by both token classes. Refresh tokens omit the
/// subject snapshot fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AuthClaims {
    pub sub: String,
    #[serde(rename = "franchiseID", default, skip_serializing_if = "Option::is_none")]
    pub franchise_id: Option<String>,
    #[serde(rename = "employeeID", default, skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<String>,
    #[serde(rename = "accountType")]
    pub account_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "mobileNo", default, skip_serializing_if = "Option::is_none")]
    pub mobile_no: Option<String>,
    #[serde(rename = "tokenType")]
    pub token_type: TokenType,
    pub jti: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Account fields snapshotted into an access token
#[derive(Debug, Clone, Default)]
pub struct SubjectSnapshot {
    pub subject: String,
    pub franchise_id: String,
    pub employee_id: String,
    pub mobile_no: String,
    pub account_type: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    /// Unix seconds
    pub expires_at: i64,
}

/// Mints and verifies access and refresh tokens with the service key pair.
#[derive(Clone)]
pub struct TokenManager {
    keys: Arc<KeyMaterial>,
    typ: String,
    issuer: String,
    audience: String,
}

impl TokenManager {
    pub fn new(keys: Arc<KeyMaterial>, config: &JwtConfig) -> Result<Self, TokenError> {
        let alg = parse_algorithm(&config.header.alg)
            .map_err(|err| TokenError::Config(err.to_string()))?;
        if alg != keys.algorithm() {
            return Err(TokenError::Config(format!(
                "header alg {:?} does not match key alg {:?}",
                alg,
                keys.algorithm()
            )));
        }
        Ok(Self {
            keys,
            typ: config.header.typ.clone(),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
        })
    }

    fn header(&self) -> Header {
        let mut header = Header::new(self.keys.algorithm());
        header.typ = Some(self.typ.clone());
        header.kid = Some(self.keys.kid().to_string());
        header
    }

    fn registered(&self, ttl: Duration) -> Result<(i64, i64, String), TokenError> {
        let seconds = i64::try_from(ttl.as_secs()).map_err(|_| TokenError::InvalidTtl)?;
        if seconds < 1 {
            return Err(TokenError::InvalidTtl);
        }
        let iat = chrono::Utc::now().timestamp();
        Ok((iat, iat + seconds, uuid::Uuid::new_v4().to_string()))
    }

    /// Sign on the blocking pool so RSA signing stays off the request task
    async fn sign(&self, claims: AuthClaims) -> Result<IssuedToken, TokenError> {
        let keys = Arc::clone(&self.keys);
        let header = self.header();
        let jti = claims.jti.clone();
        let expires_at = claims.exp;
        let token = tokio::task::spawn_blocking(move || keys.sign(&header, &claims))
            .await
            .map_err(|err| TokenError::Signing(err.to_string()))??;
        Ok(IssuedToken {
            token,
            jti,
            expires_at,
        })
    }

    pub async fn generate_access_token(
        &self,
        subject: &SubjectSnapshot,
        ttl: Duration,
    ) -> Result<IssuedToken, TokenError> {
        require(&subject.subject, "subject")?;
        require(&subject.employee_id, "employeeID")?;
        require(&subject.mobile_no, "mobileNo")?;
        require(&subject.account_type, "accountType")?;
        require(&subject.name, "name")?;

        let (iat, exp, jti) = self.registered(ttl)?;
        let franchise_id = Some(subject.franchise_id.clone()).filter(|id| !id.is_empty());
        self.sign(AuthClaims {
            sub: subject.subject.clone(),
            franchise_id,
            employee_id: Some(subject.employee_id.clone()),
            account_type: subject.account_type.clone(),
            name: Some(subject.name.clone()),
            mobile_no: Some(subject.mobile_no.clone()),
            token_type: TokenType::Access,
            jti,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat,
            exp,
        })
        .await
    }

    pub async fn generate_refresh_token(
        &self,
        subject: &str,
        account_type: &str,
        ttl: Duration,
    ) -> Result<IssuedToken, TokenError> {
        require(subject, "subject")?;
        require(account_type, "accountType")?;

        let (iat, exp, jti) = self.registered(ttl)?;
        self.sign(AuthClaims {
            sub: subject.to_string(),
            franchise_id: None,
            employee_id: None,
            account_type: account_type.to_string(),
            name: None,
            mobile_no: None,
            token_type: TokenType::Refresh,
            jti,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat,
            exp,
        })
        .await
    }

    pub fn verify_access_token(&self, token: &str) -> Result<AuthClaims, TokenError> {
        self.verify(token, TokenType::Access)
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<AuthClaims, TokenError> {
        self.verify(token, TokenType::Refresh)
    }

    fn verify(&self, token: &str, expected: TokenType) -> Result<AuthClaims, TokenError> {
        if token.trim().is_empty() {
            return Err(TokenError::InputMissing("token"));
        }
        let header =
            jsonwebtoken::decode_header(token).map_err(|err| TokenError::Invalid(err.to_string()))?;
        if header.alg != self.keys.algorithm() {
            return Err(TokenError::UnexpectedSigningMethod(format!("{:?}", header.alg)));
        }

        let mut validation = Validation::new(self.keys.algorithm());
        validation.leeway = 0;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iat", "sub", "iss", "aud"]);

        let claims: AuthClaims = self
            .keys
            .verify(token, &validation)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidAlgorithm => {
                    TokenError::UnexpectedSigningMethod(format!("{:?}", header.alg))
                }
                _ => TokenError::Invalid(err.to_string()),
            })?;

        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }
        if claims.token_type != expected {
            return Err(TokenError::WrongTokenType { expected });
        }
        Ok(claims)
    }
}

fn require(value: &str, name: &'static str) -> Result<(), TokenError> {
    if value.trim().is_empty() {
        Err(TokenError::InputMissing(name))
    } else {
        Ok(())
    }
}
