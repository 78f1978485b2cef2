use crate::config::{AccessConfig, JwtConfig};
use crate::resolver::{Account, AccountStatus, Resolver, ResolverError, SubjectResolver};
use crate::session::{SessionStore, TokenClass};
use crate::store::StoreError;
use crate::token::{AuthClaims, IssuedToken, SubjectSnapshot, TokenError, TokenManager};
use crate::validation;
use log::{debug, info, warn};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

const REFRESH_LOCK_STRIPES: usize = 64;

/// Hash compared against when the login id is unknown, so a miss costs as
/// much as a wrong password
static DUMMY_HASH: OnceLock<Option<String>> = OnceLock::new();

#[derive(Debug, Error)]
pub enum AuthnError {
    #[error("{0} is required")]
    InputMissing(&'static str),
    #[error("Wrong credentials")]
    WrongCredentials,
    #[error("{0} is required")]
    TokenRequired(&'static str),
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("Refresh token has been rotated")]
    TokenRotated,
    #[error("Session storage failed: {0}")]
    Storage(#[from] StoreError),
    #[error("Subject store failed: {0}")]
    Dependency(ResolverError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthnError {
    fn from_verification(err: TokenError, field: &'static str) -> Self {
        match err {
            TokenError::InputMissing(_) => Self::TokenRequired(field),
            other => Self::InvalidToken(other.to_string()),
        }
    }
}

impl From<TokenError> for AuthnError {
    fn from(err: TokenError) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Identity and freshly minted token pair returned by login and refresh
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub account_id: String,
    pub franchise_id: String,
    pub employee_id: String,
    pub account_type: String,
    pub name: String,
    pub mobile_no: String,
    pub access: IssuedToken,
    pub refresh: IssuedToken,
}

/// Login, refresh rotation, logout and stateless verification.
#[derive(Clone)]
pub struct AuthnService {
    resolver: Arc<Resolver>,
    tokens: Arc<TokenManager>,
    sessions: SessionStore,
    access_ttl: Duration,
    refresh_ttl: Duration,
    allowed_roles: Vec<String>,
    allowed_statuses: Vec<String>,
    refresh_locks: Arc<Vec<Mutex<()>>>,
}

impl AuthnService {
    pub fn new(
        resolver: Arc<Resolver>,
        tokens: Arc<TokenManager>,
        sessions: SessionStore,
        jwt: &JwtConfig,
        access: &AccessConfig,
    ) -> Self {
        Self {
            resolver,
            tokens,
            sessions,
            access_ttl: jwt.access_token_ttl,
            refresh_ttl: jwt.refresh_token_ttl,
            allowed_roles: access.allowed_roles.clone(),
            allowed_statuses: access.allowed_statuses.clone(),
            refresh_locks: Arc::new((0..REFRESH_LOCK_STRIPES).map(|_| Mutex::new(())).collect()),
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub async fn login(
        &self,
        login_id: &str,
        account_type: &str,
        password: &str,
    ) -> Result<AuthSession, AuthnError> {
        require(login_id, "loginID")?;
        require(account_type, "accountType")?;
        require(password, "password")?;

        if validation::validate_role(account_type, &self.allowed_roles).is_err() {
            debug!("Login rejected for account type outside the allowlist");
            return Err(AuthnError::WrongCredentials);
        }

        let account = match self.resolver.get_user(login_id, account_type).await {
            Ok(account) => account,
            Err(ResolverError::NotFound) => {
                burn_password_check(password.to_string()).await;
                return Err(AuthnError::WrongCredentials);
            }
            Err(err) => return Err(AuthnError::Dependency(err)),
        };

        if !verify_password(password.to_string(), account.password_hash.clone()).await? {
            return Err(AuthnError::WrongCredentials);
        }
        // Checked after the password so inactive accounts look like wrong passwords
        let status = validation::validate_status(&account.status.to_string(), &self.allowed_statuses);
        if status != Ok(AccountStatus::Active) {
            return Err(AuthnError::WrongCredentials);
        }

        let session = self.mint(&account).await?;
        self.sessions
            .store_token(
                TokenClass::Access,
                &account.id,
                &session.access.token,
                self.access_ttl,
            )
            .await?;
        self.sessions
            .store_token(
                TokenClass::Refresh,
                &account.id,
                &session.refresh.token,
                self.refresh_ttl,
            )
            .await?;
        info!("Account {} logged in", account.id);
        Ok(session)
    }

    /// Exchange a refresh token for a new pair. The presented token must be
    /// the one currently stored for its subject; on success it is replaced
    /// and can never be used again.
    pub async fn refresh(
        &self,
        account_id: Option<&str>,
        refresh_token: &str,
    ) -> Result<AuthSession, AuthnError> {
        if refresh_token.trim().is_empty() {
            return Err(AuthnError::TokenRequired("refreshToken"));
        }
        let claims = self
            .tokens
            .verify_refresh_token(refresh_token)
            .map_err(|err| AuthnError::from_verification(err, "refreshToken"))?;
        if let Some(account_id) = account_id.filter(|id| !id.is_empty()) {
            if account_id != claims.sub {
                return Err(AuthnError::InvalidToken("subject mismatch".to_string()));
            }
        }

        // Concurrent refreshes of one account must not both pass the check
        let _guard = self.refresh_lock(&claims.sub).lock().await;
        if !self
            .sessions
            .check_token(TokenClass::Refresh, &claims.sub, refresh_token)
            .await?
        {
            warn!("Rejected stale refresh token for account {}", claims.sub);
            return Err(AuthnError::TokenRotated);
        }

        let account = match self.resolver.get_account_by_id(&claims.sub).await {
            Ok(account) => account,
            Err(ResolverError::NotFound) => {
                return Err(AuthnError::InvalidToken("subject no longer exists".to_string()))
            }
            Err(err) => return Err(AuthnError::Dependency(err)),
        };
        if account.status != AccountStatus::Active {
            self.sessions.delete_all(&account.id).await?;
            return Err(AuthnError::InvalidToken("subject is not active".to_string()));
        }

        let session = self.mint(&account).await?;
        self.sessions
            .store_token(
                TokenClass::Refresh,
                &account.id,
                &session.refresh.token,
                self.refresh_ttl,
            )
            .await?;
        self.sessions
            .store_token(
                TokenClass::Access,
                &account.id,
                &session.access.token,
                self.access_ttl,
            )
            .await?;
        debug!("Rotated tokens for account {}", account.id);
        Ok(session)
    }

    /// Drop both stored tokens. A refresh token that is no longer stored is
    /// rejected, so a second logout with the same token fails.
    pub async fn logout(&self, refresh_token: &str) -> Result<(), AuthnError> {
        if refresh_token.trim().is_empty() {
            return Err(AuthnError::TokenRequired("refreshToken"));
        }
        let claims = self
            .tokens
            .verify_refresh_token(refresh_token)
            .map_err(|err| AuthnError::from_verification(err, "refreshToken"))?;

        let _guard = self.refresh_lock(&claims.sub).lock().await;
        if !self
            .sessions
            .check_token(TokenClass::Refresh, &claims.sub, refresh_token)
            .await?
        {
            return Err(AuthnError::InvalidToken("refresh token is not active".to_string()));
        }
        self.sessions.delete_all(&claims.sub).await?;
        info!("Account {} logged out", claims.sub);
        Ok(())
    }

    /// Stateless: the session store is not consulted
    pub fn verify(&self, access_token: &str) -> Result<AuthClaims, AuthnError> {
        if access_token.trim().is_empty() {
            return Err(AuthnError::TokenRequired("accessToken"));
        }
        self.tokens
            .verify_access_token(access_token)
            .map_err(|err| AuthnError::from_verification(err, "accessToken"))
    }

    async fn mint(&self, account: &Account) -> Result<AuthSession, AuthnError> {
        let snapshot = SubjectSnapshot {
            subject: account.id.clone(),
            franchise_id: account.franchise_id.clone(),
            employee_id: account.employee_id.clone(),
            mobile_no: account.mobile_no.clone(),
            account_type: account.account_type.clone(),
            name: account.name.clone(),
        };
        let (access, refresh) = tokio::try_join!(
            self.tokens.generate_access_token(&snapshot, self.access_ttl),
            self.tokens
                .generate_refresh_token(&account.id, &account.account_type, self.refresh_ttl),
        )?;

        Ok(AuthSession {
            account_id: account.id.clone(),
            franchise_id: account.franchise_id.clone(),
            employee_id: account.employee_id.clone(),
            account_type: account.account_type.clone(),
            name: account.name.clone(),
            mobile_no: account.mobile_no.clone(),
            access,
            refresh,
        })
    }

    fn refresh_lock(&self, account_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        account_id.hash(&mut hasher);
        let stripe = (hasher.finish() % self.refresh_locks.len() as u64) as usize;
        &self.refresh_locks[stripe]
    }
}

fn require(value: &str, name: &'static str) -> Result<(), AuthnError> {
    validation::require(value, name)
        .map(|_| ())
        .map_err(|_| AuthnError::InputMissing(name))
}

/// bcrypt is CPU bound; run it on the blocking pool
async fn verify_password(password: String, hash: String) -> Result<bool, AuthnError> {
    if hash.is_empty() {
        return Ok(false);
    }
    let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|err| AuthnError::Internal(err.to_string()))?;
    match verified {
        Ok(matches) => Ok(matches),
        Err(err) => {
            warn!("Stored password hash could not be checked: {}", err);
            Ok(false)
        }
    }
}

async fn burn_password_check(password: String) {
    let result = tokio::task::spawn_blocking(move || {
        let dummy = DUMMY_HASH.get_or_init(|| bcrypt::hash("unused", bcrypt::DEFAULT_COST).ok());
        if let Some(hash) = dummy {
            let _ = bcrypt::verify(password, hash);
        }
    })
    .await;
    if let Err(err) = result {
        debug!("Dummy password check did not complete: {}", err);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::LightningConfig;
    use crate::resolver::memory::tests::account;
    use crate::resolver::memory::MemoryResolver;
    use crate::store::lightning::LightningStore;
    use crate::store::Store;
    use crate::token::tests::manager;
    use crate::token::TokenType;

    pub const PASSWORD: &str = "p";

    pub fn account_with_password(id: &str, franchise_id: &str, role_id: &str) -> Account {
        let mut account = account(id, franchise_id, role_id);
        account.password_hash = bcrypt::hash(PASSWORD, 4).unwrap();
        account
    }

    fn service_with(resolver: MemoryResolver, access: &AccessConfig) -> AuthnService {
        let store = Arc::new(Store::Lightning(LightningStore::new(
            &LightningConfig::default(),
            None,
        )));
        AuthnService::new(
            Arc::new(Resolver::Memory(resolver)),
            Arc::new(manager()),
            SessionStore::new(store),
            &JwtConfig::default(),
            access,
        )
    }

    fn service() -> (AuthnService, MemoryResolver) {
        let resolver = MemoryResolver::new();
        resolver.add_account(account_with_password("a1", "f1", "r1"));
        (service_with(resolver.clone(), &AccessConfig::default()), resolver)
    }

    #[tokio::test]
    async fn test_login_returns_token_pair() {
        let (service, _) = service();
        let session = service.login("a1", "admin", PASSWORD).await.unwrap();

        assert_eq!(session.account_id, "a1");
        assert_eq!(session.employee_id, "emp-a1");
        assert!(session.refresh.expires_at > session.access.expires_at);

        let claims = service.verify(&session.access.token).unwrap();
        assert_eq!(claims.sub, "a1");
        assert_eq!(claims.franchise_id.as_deref(), Some("f1"));
        assert_eq!(claims.token_type, TokenType::Access);
    }

    #[tokio::test]
    async fn test_login_failures_are_indistinguishable() {
        let (service, resolver) = service();
        let mut blocked = account_with_password("a2", "f1", "r1");
        blocked.status = AccountStatus::Blocked;
        resolver.add_account(blocked);

        for (login, password) in [("a1", "wrong"), ("ghost", PASSWORD), ("a2", PASSWORD)] {
            assert!(matches!(
                service.login(login, "admin", password).await,
                Err(AuthnError::WrongCredentials)
            ));
        }
    }

    #[tokio::test]
    async fn test_login_requires_every_field() {
        let (service, _) = service();
        assert!(matches!(
            service.login("", "admin", PASSWORD).await,
            Err(AuthnError::InputMissing("loginID"))
        ));
        assert!(matches!(
            service.login("a1", "admin", " ").await,
            Err(AuthnError::InputMissing("password"))
        ));
    }

    #[tokio::test]
    async fn test_login_honors_role_allowlist() {
        let resolver = MemoryResolver::new();
        resolver.add_account(account_with_password("a1", "f1", "r1"));
        let access = AccessConfig {
            allowed_roles: vec!["employee".to_string()],
            ..AccessConfig::default()
        };
        let service = service_with(resolver, &access);
        assert!(matches!(
            service.login("a1", "admin", PASSWORD).await,
            Err(AuthnError::WrongCredentials)
        ));
    }

    #[tokio::test]
    async fn test_refresh_rotation() {
        let (service, _) = service();
        let first = service.login("a1", "admin", PASSWORD).await.unwrap();

        let second = service.refresh(Some("a1"), &first.refresh.token).await.unwrap();
        assert_ne!(second.refresh.token, first.refresh.token);

        assert!(matches!(
            service.refresh(None, &first.refresh.token).await,
            Err(AuthnError::TokenRotated)
        ));
        // Access tokens stay valid until they expire
        assert!(service.verify(&first.access.token).is_ok());
        assert!(service.refresh(None, &second.refresh.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_rejects_access_token_and_foreign_subject() {
        let (service, _) = service();
        let session = service.login("a1", "admin", PASSWORD).await.unwrap();

        assert!(matches!(
            service.refresh(None, &session.access.token).await,
            Err(AuthnError::InvalidToken(_))
        ));
        assert!(matches!(
            service.refresh(Some("a9"), &session.refresh.token).await,
            Err(AuthnError::InvalidToken(_))
        ));
        assert!(matches!(
            service.refresh(None, "").await,
            Err(AuthnError::TokenRequired("refreshToken"))
        ));
    }

    #[tokio::test]
    async fn test_refresh_picks_up_revocation() {
        let (service, resolver) = service();
        let session = service.login("a1", "admin", PASSWORD).await.unwrap();

        let mut suspended = account_with_password("a1", "f1", "r1");
        suspended.status = AccountStatus::Suspended;
        resolver.add_account(suspended);

        assert!(matches!(
            service.refresh(None, &session.refresh.token).await,
            Err(AuthnError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_rotates_once() {
        let (service, _) = service();
        let session = service.login("a1", "admin", PASSWORD).await.unwrap();

        let (left, right) = tokio::join!(
            service.refresh(None, &session.refresh.token),
            service.refresh(None, &session.refresh.token)
        );
        assert_eq!(left.is_ok() as u8 + right.is_ok() as u8, 1);
    }

    #[tokio::test]
    async fn test_logout_twice_fails_second_time() {
        let (service, _) = service();
        let session = service.login("a1", "admin", PASSWORD).await.unwrap();

        service.logout(&session.refresh.token).await.unwrap();
        assert!(matches!(
            service.logout(&session.refresh.token).await,
            Err(AuthnError::InvalidToken(_))
        ));
        assert!(matches!(
            service.refresh(None, &session.refresh.token).await,
            Err(AuthnError::TokenRotated)
        ));
    }

    #[tokio::test]
    async fn test_verify_requires_token() {
        let (service, _) = service();
        assert!(matches!(
            service.verify(" "),
            Err(AuthnError::TokenRequired("accessToken"))
        ));
        assert!(matches!(
            service.verify("not.a.token"),
            Err(AuthnError::InvalidToken(_))
        ));
    }
}
