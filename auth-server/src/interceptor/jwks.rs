use super::InterceptorError;
use crate::keys::{Jwks, KeyMaterial};
use jsonwebtoken::{Algorithm, DecodingKey};
use log::{debug, info, warn};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Where verification keys come from
pub enum JwksSource {
    /// A JWKS endpoint, polled by the refresher
    Remote { url: String, client: Client },
    /// This process's own key pair, loaded once
    Local,
}

struct KeySnapshot {
    keys: HashMap<String, (Algorithm, DecodingKey)>,
    /// `None` for local keys, which never go stale
    valid_until: Option<Instant>,
}

/// Memoized key set. The refresher task is the only writer; request
/// handlers take a cheap snapshot under a read lock.
pub struct JwksCache {
    source: JwksSource,
    stale_ttl: Duration,
    snapshot: RwLock<Option<Arc<KeySnapshot>>>,
}

impl JwksCache {
    pub fn remote(url: &str, fetch_timeout: Duration, stale_ttl: Duration) -> Result<Self, InterceptorError> {
        let client = Client::builder()
            .timeout(fetch_timeout)
            .connect_timeout(fetch_timeout)
            .build()
            .map_err(|err| InterceptorError::Fetch(err.to_string()))?;
        Ok(Self {
            source: JwksSource::Remote {
                url: url.to_string(),
                client,
            },
            stale_ttl,
            snapshot: RwLock::new(None),
        })
    }

    /// Serve the local key pair; nothing to fetch
    pub fn local(material: Arc<KeyMaterial>) -> Self {
        let mut keys = HashMap::new();
        keys.insert(
            material.kid().to_string(),
            (material.algorithm(), material.decoding_key().clone()),
        );
        let snapshot = KeySnapshot {
            keys,
            valid_until: None,
        };
        Self {
            source: JwksSource::Local,
            stale_ttl: Duration::ZERO,
            snapshot: RwLock::new(Some(Arc::new(snapshot))),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.source, JwksSource::Remote { .. })
    }

    /// Fetch the key set and swap it in. On failure the previous set keeps
    /// serving until its validity runs out.
    pub async fn refresh(&self) -> Result<usize, InterceptorError> {
        let JwksSource::Remote { url, client } = &self.source else {
            return Ok(self.len());
        };

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|err| InterceptorError::Fetch(err.to_string()))?;
        if !response.status().is_success() {
            return Err(InterceptorError::Fetch(format!(
                "JWKS endpoint returned {}",
                response.status()
            )));
        }
        let jwks: Jwks = response
            .json()
            .await
            .map_err(|err| InterceptorError::Fetch(err.to_string()))?;

        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            match jwk.decoding_key() {
                Ok(key) => {
                    keys.insert(jwk.kid.clone(), key);
                }
                Err(err) => warn!("Skipping JWKS entry {}: {}", jwk.kid, err),
            }
        }
        if keys.is_empty() {
            return Err(InterceptorError::Fetch(
                "JWKS contained no usable keys".to_string(),
            ));
        }

        let count = keys.len();
        let snapshot = KeySnapshot {
            keys,
            valid_until: Some(Instant::now() + self.stale_ttl),
        };
        let mut guard = self
            .snapshot
            .write()
            .map_err(|_| InterceptorError::KeysUnavailable)?;
        *guard = Some(Arc::new(snapshot));
        debug!("Loaded {} verification keys from JWKS", count);
        Ok(count)
    }

    /// Key advertised under `kid`. Fails closed once the set is stale.
    pub fn key(&self, kid: &str) -> Result<(Algorithm, DecodingKey), InterceptorError> {
        let snapshot = self
            .snapshot
            .read()
            .map_err(|_| InterceptorError::KeysUnavailable)?
            .clone()
            .ok_or(InterceptorError::KeysUnavailable)?;
        if snapshot
            .valid_until
            .is_some_and(|valid_until| Instant::now() >= valid_until)
        {
            return Err(InterceptorError::KeysUnavailable);
        }
        snapshot
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| InterceptorError::UnknownKey(kid.to_string()))
    }

    fn len(&self) -> usize {
        self.snapshot
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|snapshot| snapshot.keys.len()))
            .unwrap_or(0)
    }
}

/// Poll the JWKS endpoint every `every` until `shutdown` fires
pub fn spawn_refresher(cache: Arc<JwksCache>, every: Duration, shutdown: CancellationToken) {
    if !cache.is_remote() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Starting JWKS refresher every {:?}", every);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("JWKS refresher shutting down");
                    break;
                }
                _ = ticker.tick() => {}
            }
            if let Err(err) = cache.refresh().await {
                warn!("JWKS refresh failed, keeping previous key set: {}", err);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::rsa_material;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    async fn jwks_server(status: u16, expected_calls: u64) -> MockServer {
        let server = MockServer::start().await;
        let body = serde_json::to_value(rsa_material("kid-1").jwks()).unwrap();
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/.well-known/jwks.json"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .expect(expected_calls)
            .mount(&server)
            .await;
        server
    }

    fn remote(server: &MockServer, stale_ttl: Duration) -> JwksCache {
        JwksCache::remote(
            &format!("{}/.well-known/jwks.json", server.uri()),
            Duration::from_secs(2),
            stale_ttl,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_remote_keys_are_loaded_by_kid() {
        let server = jwks_server(200, 1).await;
        let cache = remote(&server, Duration::from_secs(60));

        assert!(matches!(cache.key("kid-1"), Err(InterceptorError::KeysUnavailable)));
        assert_eq!(cache.refresh().await.unwrap(), 1);

        let (alg, _) = cache.key("kid-1").unwrap();
        assert_eq!(alg, Algorithm::RS256);
        assert!(matches!(cache.key("kid-2"), Err(InterceptorError::UnknownKey(_))));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_set() {
        let server = MockServer::start().await;
        let body = serde_json::to_value(rsa_material("kid-1").jwks()).unwrap();
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cache = remote(&server, Duration::from_secs(60));
        cache.refresh().await.unwrap();
        assert!(cache.refresh().await.is_err());
        assert!(cache.key("kid-1").is_ok());
    }

    #[tokio::test]
    async fn test_stale_set_fails_closed() {
        let server = jwks_server(200, 1).await;
        let cache = remote(&server, Duration::from_millis(20));
        cache.refresh().await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(cache.key("kid-1"), Err(InterceptorError::KeysUnavailable)));
    }

    #[tokio::test]
    async fn test_local_source_never_goes_stale() {
        let cache = JwksCache::local(Arc::new(rsa_material("kid-1")));
        assert!(!cache.is_remote());
        assert_eq!(cache.refresh().await.unwrap(), 1);
        assert!(cache.key("kid-1").is_ok());
    }
}
