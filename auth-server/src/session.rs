use crate::store::{KeyValueStore, Store, StoreError, StoreValue};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Which of an account's issued tokens a session entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenClass {
    Access,
    Refresh,
}

impl TokenClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access_token",
            Self::Refresh => "refresh_token",
        }
    }
}

impl fmt::Display for TokenClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Issued tokens keyed by `<accountID>:<tokenClass>`. Storing a token
/// replaces the previous one of the same class, so at most one refresh token
/// per account is live.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<Store>,
}

impl SessionStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn key(class: TokenClass, account_id: &str) -> String {
        format!("{}:{}", account_id, class)
    }

    pub async fn store_token(
        &self,
        class: TokenClass,
        account_id: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store
            .set_with_ttl(
                &Self::key(class, account_id),
                StoreValue::from(token),
                ttl,
            )
            .await
    }

    /// True only when a live token is stored and equals `expected` exactly
    pub async fn check_token(
        &self,
        class: TokenClass,
        account_id: &str,
        expected: &str,
    ) -> Result<bool, StoreError> {
        match self.store.get(&Self::key(class, account_id)).await {
            Ok(value) => Ok(value.as_bytes() == expected.as_bytes()),
            Err(StoreError::KeyNotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn delete_token(&self, class: TokenClass, account_id: &str) -> Result<(), StoreError> {
        self.store.delete(&Self::key(class, account_id)).await
    }

    /// Remove both token classes for the account
    pub async fn delete_all(&self, account_id: &str) -> Result<(), StoreError> {
        self.delete_token(TokenClass::Refresh, account_id).await?;
        self.delete_token(TokenClass::Access, account_id).await
    }
}
