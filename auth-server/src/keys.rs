use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::info;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rsa::traits::PublicKeyParts;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Failed to read key file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse PEM: {0}")]
    Pem(String),
    #[error("Unexpected PEM block type {found}, expected {expected}")]
    BlockType { found: String, expected: String },
    #[error("Key is not a {0} key")]
    Family(&'static str),
    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Private and public keys do not form a pair")]
    Mismatch,
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Asymmetric algorithm families accepted for signing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    Ec,
}

impl KeyFamily {
    pub fn of(alg: Algorithm) -> Option<Self> {
        match alg {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => Some(Self::Rsa),
            Algorithm::ES256 => Some(Self::Ec),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Rsa => "RSA",
            Self::Ec => "EC P-256",
        }
    }
}

/// Parse a configured algorithm name, accepting only asymmetric algorithms
pub fn parse_algorithm(name: &str) -> Result<Algorithm, KeyError> {
    let alg = Algorithm::from_str(name.trim())
        .map_err(|_| KeyError::UnsupportedAlgorithm(name.to_string()))?;
    KeyFamily::of(alg)
        .map(|_| alg)
        .ok_or_else(|| KeyError::UnsupportedAlgorithm(name.to_string()))
}

/// One published verification key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Jwk {
    pub kty: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub use_field: String,
    pub kid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

impl Jwk {
    /// Build a verification key from the published components
    pub fn decoding_key(&self) -> Result<(Algorithm, DecodingKey), KeyError> {
        let alg = parse_algorithm(&self.alg)?;
        let key = match (KeyFamily::of(alg), self.kty.as_str()) {
            (Some(KeyFamily::Rsa), "RSA") => match (&self.n, &self.e) {
                (Some(n), Some(e)) => DecodingKey::from_rsa_components(n, e)?,
                _ => return Err(KeyError::Family("RSA")),
            },
            (Some(KeyFamily::Ec), "EC") => match (&self.x, &self.y) {
                (Some(x), Some(y)) => DecodingKey::from_ec_components(x, y)?,
                _ => return Err(KeyError::Family("EC P-256")),
            },
            (Some(family), _) => return Err(KeyError::Family(family.name())),
            (None, _) => return Err(KeyError::UnsupportedAlgorithm(self.alg.clone())),
        };
        Ok((alg, key))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

impl Jwks {
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|key| key.kid == kid)
    }
}

/// The service's signing key pair. Immutable after load.
pub struct KeyMaterial {
    kid: String,
    alg: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    jwk: Jwk,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("kid", &self.kid)
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

/// Return the label of the first PEM block, e.g. `PUBLIC KEY`
fn pem_label(pem: &str) -> Result<&str, KeyError> {
    pem.lines()
        .map(str::trim)
        .find_map(|line| {
            line.strip_prefix("-----BEGIN ")
                .and_then(|rest| rest.strip_suffix("-----"))
        })
        .ok_or_else(|| KeyError::Pem("no PEM block found".to_string()))
}

fn expect_label(pem: &str, allowed: &[&str]) -> Result<(), KeyError> {
    let label = pem_label(pem)?;
    if allowed.contains(&label) {
        Ok(())
    } else {
        Err(KeyError::BlockType {
            found: label.to_string(),
            expected: allowed.join(" or "),
        })
    }
}

fn read_pem(path: &str) -> Result<String, KeyError> {
    std::fs::read_to_string(Path::new(path)).map_err(|source| KeyError::Io {
        path: path.to_string(),
        source,
    })
}

impl KeyMaterial {
    /// Load the key pair from PEM files
    pub fn load(
        private_key_path: &str,
        public_key_path: &str,
        alg: &str,
        kid: &str,
    ) -> Result<Self, KeyError> {
        let private_pem = read_pem(private_key_path)?;
        let public_pem = read_pem(public_key_path)?;
        let material = Self::from_pem(&private_pem, &public_pem, parse_algorithm(alg)?, kid)?;
        info!("Loaded {:?} signing key with kid {}", material.alg, material.kid);
        Ok(material)
    }

    pub fn from_pem(
        private_pem: &str,
        public_pem: &str,
        alg: Algorithm,
        kid: &str,
    ) -> Result<Self, KeyError> {
        let family = KeyFamily::of(alg)
            .ok_or_else(|| KeyError::UnsupportedAlgorithm(format!("{:?}", alg)))?;

        let (encoding_key, decoding_key, jwk) = match family {
            KeyFamily::Rsa => {
                expect_label(private_pem, &["PRIVATE KEY", "RSA PRIVATE KEY"])?;
                expect_label(public_pem, &["PUBLIC KEY", "RSA PUBLIC KEY"])?;
                let public = parse_rsa_public(public_pem)?;
                let n = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
                let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());
                let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
                    .map_err(|_| KeyError::Family("RSA"))?;
                let decoding_key = DecodingKey::from_rsa_components(&n, &e)?;
                let jwk = Jwk {
                    kty: "RSA".to_string(),
                    alg: format!("{:?}", alg),
                    use_field: "sig".to_string(),
                    kid: kid.to_string(),
                    n: Some(n),
                    e: Some(e),
                    crv: None,
                    x: None,
                    y: None,
                };
                (encoding_key, decoding_key, jwk)
            }
            KeyFamily::Ec => {
                expect_label(private_pem, &["PRIVATE KEY"])?;
                expect_label(public_pem, &["PUBLIC KEY"])?;
                let public = parse_ec_public(public_pem)?;
                let point = public.to_encoded_point(false);
                let (x, y) = match (point.x(), point.y()) {
                    (Some(x), Some(y)) => (URL_SAFE_NO_PAD.encode(x), URL_SAFE_NO_PAD.encode(y)),
                    _ => return Err(KeyError::Family("EC P-256")),
                };
                let encoding_key = EncodingKey::from_ec_pem(private_pem.as_bytes())
                    .map_err(|_| KeyError::Family("EC P-256"))?;
                let decoding_key = DecodingKey::from_ec_pem(public_pem.as_bytes())?;
                let jwk = Jwk {
                    kty: "EC".to_string(),
                    alg: format!("{:?}", alg),
                    use_field: "sig".to_string(),
                    kid: kid.to_string(),
                    n: None,
                    e: None,
                    crv: Some("P-256".to_string()),
                    x: Some(x),
                    y: Some(y),
                };
                (encoding_key, decoding_key, jwk)
            }
        };

        let material = Self {
            kid: kid.to_string(),
            alg,
            encoding_key,
            decoding_key,
            jwk,
        };
        material.probe()?;
        Ok(material)
    }

    /// Sign and verify a throwaway payload so a mismatched pair fails at boot
    fn probe(&self) -> Result<(), KeyError> {
        #[derive(Serialize, Deserialize)]
        struct Probe {
            probe: bool,
        }

        let token = self.sign(&Header::new(self.alg), &Probe { probe: true })?;
        let mut validation = Validation::new(self.alg);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        validation.validate_aud = false;
        self.verify::<Probe>(&token, &validation)
            .map(|_| ())
            .map_err(|_| KeyError::Mismatch)
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn algorithm(&self) -> Algorithm {
        self.alg
    }

    pub fn family(&self) -> KeyFamily {
        // Construction only admits algorithms with a family
        KeyFamily::of(self.alg).unwrap_or(KeyFamily::Rsa)
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// Produce a signed compact token with the private key
    pub fn sign<T: Serialize>(&self, header: &Header, claims: &T) -> Result<String, KeyError> {
        Ok(jsonwebtoken::encode(header, claims, &self.encoding_key)?)
    }

    /// Check the signature and the rules in `validation` with the public key
    pub fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        validation: &Validation,
    ) -> Result<T, jsonwebtoken::errors::Error> {
        jsonwebtoken::decode::<T>(token, &self.decoding_key, validation).map(|data| data.claims)
    }

    pub fn jwks(&self) -> Jwks {
        Jwks {
            keys: vec![self.jwk.clone()],
        }
    }
}

fn parse_rsa_public(pem: &str) -> Result<rsa::RsaPublicKey, KeyError> {
    use rsa::pkcs1::DecodeRsaPublicKey;
    use rsa::pkcs8::DecodePublicKey;

    match pem_label(pem)? {
        "RSA PUBLIC KEY" => {
            rsa::RsaPublicKey::from_pkcs1_pem(pem).map_err(|err| KeyError::Pem(err.to_string()))
        }
        _ => rsa::RsaPublicKey::from_public_key_pem(pem).map_err(|_| KeyError::Family("RSA")),
    }
}

fn parse_ec_public(pem: &str) -> Result<p256::PublicKey, KeyError> {
    use p256::pkcs8::DecodePublicKey;

    p256::PublicKey::from_public_key_pem(pem).map_err(|_| KeyError::Family("EC P-256"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const RSA_PRIVATE: &str = include_str!("../testdata/rsa_private.pem");
    pub const RSA_PUBLIC: &str = include_str!("../testdata/rsa_public.pem");
    pub const RSA_OTHER_PUBLIC: &str = include_str!("../testdata/rsa_other_public.pem");
    pub const EC_PRIVATE: &str = include_str!("../testdata/ec_private.pem");
    pub const EC_PUBLIC: &str = include_str!("../testdata/ec_public.pem");

    pub fn rsa_material(kid: &str) -> KeyMaterial {
        KeyMaterial::from_pem(RSA_PRIVATE, RSA_PUBLIC, Algorithm::RS256, kid)
            .expect("Failed to load RSA fixture")
    }

    #[test]
    fn test_rsa_jwks_entry() {
        let material = rsa_material("kid-1");
        let jwks = material.jwks();
        assert_eq!(jwks.keys.len(), 1);

        let jwk = &jwks.keys[0];
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.alg, "RS256");
        assert_eq!(jwk.use_field, "sig");
        assert_eq!(jwk.kid, "kid-1");
        assert_eq!(jwk.e.as_deref(), Some("AQAB"));
        assert!(jwk.n.is_some());
        assert!(jwk.x.is_none());

        let json = serde_json::to_value(&jwks).unwrap();
        assert_eq!(json["keys"][0]["use"], "sig");
        assert!(json["keys"][0].get("crv").is_none());
    }

    #[test]
    fn test_ec_jwks_entry() {
        let material =
            KeyMaterial::from_pem(EC_PRIVATE, EC_PUBLIC, Algorithm::ES256, "ec-1").unwrap();
        let jwk = &material.jwks().keys[0];
        assert_eq!(jwk.kty, "EC");
        assert_eq!(jwk.crv.as_deref(), Some("P-256"));
        assert!(jwk.x.is_some() && jwk.y.is_some());
        assert_eq!(material.family(), KeyFamily::Ec);
    }

    #[test]
    fn test_published_jwk_verifies_signed_tokens() {
        #[derive(Serialize, Deserialize)]
        struct Claims {
            sub: String,
            exp: i64,
        }

        let material = rsa_material("kid-1");
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("kid-1".to_string());
        let claims = Claims {
            sub: "a1".to_string(),
            exp: chrono::Utc::now().timestamp() + 60,
        };
        let token = material.sign(&header, &claims).unwrap();

        let (alg, key) = material.jwks().find("kid-1").unwrap().decoding_key().unwrap();
        assert_eq!(alg, Algorithm::RS256);
        let decoded =
            jsonwebtoken::decode::<Claims>(&token, &key, &Validation::new(alg)).unwrap();
        assert_eq!(decoded.claims.sub, "a1");
    }

    #[test]
    fn test_wrong_block_type_is_rejected() {
        let result = KeyMaterial::from_pem(RSA_PUBLIC, RSA_PUBLIC, Algorithm::RS256, "k");
        assert!(matches!(result, Err(KeyError::BlockType { .. })));
    }

    #[test]
    fn test_wrong_family_is_rejected() {
        // An EC public key where an RSA key is expected
        let result = KeyMaterial::from_pem(RSA_PRIVATE, EC_PUBLIC, Algorithm::RS256, "k");
        assert!(matches!(result, Err(KeyError::Family("RSA"))));

        let result = KeyMaterial::from_pem(EC_PRIVATE, RSA_PUBLIC, Algorithm::ES256, "k");
        assert!(matches!(result, Err(KeyError::Family("EC P-256"))));
    }

    #[test]
    fn test_mismatched_pair_is_rejected() {
        let result = KeyMaterial::from_pem(RSA_PRIVATE, RSA_OTHER_PUBLIC, Algorithm::RS256, "k");
        assert!(matches!(result, Err(KeyError::Mismatch)));
    }

    #[test]
    fn test_symmetric_algorithms_are_rejected() {
        assert!(matches!(
            parse_algorithm("HS256"),
            Err(KeyError::UnsupportedAlgorithm(_))
        ));
        assert!(parse_algorithm("none").is_err());
        assert_eq!(parse_algorithm("PS256").unwrap(), Algorithm::PS256);
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        let result = KeyMaterial::from_pem("not a key", RSA_PUBLIC, Algorithm::RS256, "k");
        assert!(matches!(result, Err(KeyError::Pem(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = KeyMaterial::load("/nonexistent/private.pem", "/nonexistent/public.pem", "RS256", "k");
        assert!(matches!(result, Err(KeyError::Io { .. })));
    }
}
