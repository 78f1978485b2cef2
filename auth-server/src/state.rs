use crate::authn::AuthnService;
use crate::authz::AuthzService;
use crate::config::AppConfig;
use crate::decision_cache::DecisionCache;
use crate::interceptor::{AuthInterceptor, InterceptorError};
use crate::keys::{KeyError, KeyMaterial};
use crate::policy::{Policy, PolicyError, PolicyEvaluator};
use crate::resolver::memory::MemoryResolver;
use crate::resolver::postgres::PostgresResolver;
use crate::resolver::{Resolver, ResolverError, SubjectResolver};
use crate::session::SessionStore;
use crate::store::{create_store, KeyValueStore, Store, StoreError};
use crate::token::{TokenError, TokenManager};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to load signing keys: {0}")]
    Keys(#[from] KeyError),
    #[error("Failed to initialize store: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to initialize token manager: {0}")]
    Token(#[from] TokenError),
    #[error("Failed to initialize policy engine: {0}")]
    Policy(#[from] PolicyError),
    #[error("Failed to initialize bearer verification: {0}")]
    Interceptor(#[from] InterceptorError),
    #[error("Failed to initialize subject store: {0}")]
    Resolver(#[from] ResolverError),
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub keys: Arc<KeyMaterial>,
    pub store: Arc<Store>,
    pub resolver: Arc<Resolver>,
    pub policy: Arc<Policy>,
    pub authn: Arc<AuthnService>,
    pub authz: Arc<AuthzService>,
    pub interceptor: Arc<AuthInterceptor>,
}

impl AppState {
    /// Build every subsystem from configuration
    pub async fn new(config: AppConfig) -> Result<Self, StartupError> {
        let keys = Arc::new(KeyMaterial::load(
            &config.jwt.private_key_path,
            &config.jwt.public_key_path,
            &config.jwt.header.alg,
            &config.jwt.header.key_id,
        )?);
        let store = Arc::new(create_store(&config.store).await?);

        let resolver = if !config.database.url.is_empty() {
            Resolver::Postgres(PostgresResolver::connect_lazy(&config.database)?)
        } else if !config.database.seed_file.is_empty() {
            warn!("DATABASE_URL is not set, serving subjects from the seed file");
            Resolver::Memory(MemoryResolver::from_seed_file(Path::new(
                &config.database.seed_file,
            ))?)
        } else {
            warn!("DATABASE_URL is not set, serving subjects from an empty in-memory store");
            Resolver::Memory(MemoryResolver::new())
        };
        let policy = Policy::from_config(&config.policy)?;
        info!("Using '{}' policy engine", policy.engine_name());

        let interceptor =
            AuthInterceptor::from_config(&config.interceptor, &config.jwt, Arc::clone(&keys))
                .await?;

        Self::assemble(config, keys, store, resolver, policy, interceptor)
    }

    /// Wire the services over already constructed backends
    pub fn assemble(
        config: AppConfig,
        keys: Arc<KeyMaterial>,
        store: Arc<Store>,
        resolver: Resolver,
        policy: Policy,
        interceptor: AuthInterceptor,
    ) -> Result<Self, StartupError> {
        let resolver = Arc::new(resolver);
        let policy = Arc::new(policy);
        let tokens = Arc::new(TokenManager::new(Arc::clone(&keys), &config.jwt)?);

        let authn = AuthnService::new(
            Arc::clone(&resolver),
            tokens,
            SessionStore::new(Arc::clone(&store)),
            &config.jwt,
            &config.access,
        );
        let authz = AuthzService::new(
            Arc::clone(&resolver),
            Arc::clone(&policy),
            DecisionCache::new(Arc::clone(&store)),
            &config.decision,
            &config.policy.version,
        );

        Ok(Self {
            config: Arc::new(config),
            keys,
            store,
            resolver,
            policy,
            authn: Arc::new(authn),
            authz: Arc::new(authz),
            interceptor: Arc::new(interceptor),
        })
    }

    /// Store, subject store and policy engine, by name
    pub async fn component_health(&self) -> Vec<(&'static str, Result<(), String>)> {
        let (store, resolver, policy) = tokio::join!(
            self.store.health_check(),
            self.resolver.health_check(),
            self.policy.health_check()
        );
        vec![("store", store), ("subjects", resolver), ("policy", policy)]
    }

    #[cfg(test)]
    pub fn for_testing(resolver: MemoryResolver) -> Self {
        Self::for_testing_with(resolver, AppConfig::default())
    }

    /// Test state over the given configuration, with local keys and an
    /// in-process store
    #[cfg(test)]
    pub fn for_testing_with(resolver: MemoryResolver, config: AppConfig) -> Self {
        use crate::config::LightningConfig;
        use crate::interceptor::JwksCache;
        use crate::keys::tests::rsa_material;
        use crate::store::lightning::LightningStore;

        let keys = Arc::new(rsa_material(&config.jwt.header.key_id));
        let store = Arc::new(Store::Lightning(LightningStore::new(
            &LightningConfig::default(),
            None,
        )));
        let policy = Policy::from_config(&config.policy).expect("Failed to build test policy");
        let interceptor = AuthInterceptor::new(
            Arc::new(JwksCache::local(Arc::clone(&keys))),
            &config.jwt,
        )
        .expect("Failed to build test interceptor");

        Self::assemble(
            config,
            keys,
            store,
            Resolver::Memory(resolver),
            policy,
            interceptor,
        )
        .expect("Failed to build test state")
    }
}
