use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod memory;
pub mod postgres;
pub mod query;

/// resource -> allowed actions
pub type RolePermissions = BTreeMap<String, BTreeSet<String>>;

/// `resource:action` -> granted (`false` is an explicit deny)
pub type DirectPermissions = BTreeMap<String, bool>;

/// Key used for direct permission lookups. `%` and `:` inside either part
/// are percent-escaped, so the separator is always the only bare colon.
pub fn permission_key(resource: &str, action: &str) -> String {
    fn escape(part: &str) -> String {
        part.replace('%', "%25").replace(':', "%3A")
    }
    format!("{}:{}", escape(resource), escape(action))
}

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("Record not found")]
    NotFound,
    #[error("Query rejected: {0}")]
    Query(#[from] query::QueryError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Invalid stored value: {0}")]
    Corrupt(String),
    #[error("Failed to load subject seed: {0}")]
    Seed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Inactive,
    Suspended,
    Blocked,
    Limited,
}

impl FromStr for AccountStatus {
    type Err = ResolverError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "suspended" => Ok(Self::Suspended),
            "blocked" => Ok(Self::Blocked),
            "limited" => Ok(Self::Limited),
            other => Err(ResolverError::Corrupt(format!("account status {}", other))),
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Suspended => "suspended",
            Self::Blocked => "blocked",
            Self::Limited => "limited",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
pub struct Account {
    pub id: String,
    pub franchise_id: String,
    pub employee_id: String,
    pub login_id: String,
    pub password_hash: String,
    pub account_type: String,
    pub name: String,
    pub mobile_no: String,
    pub email: String,
    pub role_id: String,
    pub status: AccountStatus,
}

// The password hash stays out of logs
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("franchise_id", &self.franchise_id)
            .field("account_type", &self.account_type)
            .field("role_id", &self.role_id)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Tenant binding of an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRole {
    pub account_id: String,
    pub franchise_id: String,
    pub role_id: String,
    pub account_type: String,
}

/// Read-only view of the account administration data.
#[async_trait]
pub trait SubjectResolver: Send + Sync {
    /// Fails with [`ResolverError::NotFound`] when the account is not bound
    /// to the franchise
    async fn get_account_role(
        &self,
        franchise_id: &str,
        account_id: &str,
    ) -> Result<AccountRole, ResolverError>;

    async fn get_role_permissions(&self, role_id: &str) -> Result<RolePermissions, ResolverError>;

    async fn get_direct_permissions(
        &self,
        account_id: &str,
    ) -> Result<DirectPermissions, ResolverError>;

    async fn get_user(&self, login_id: &str, account_type: &str)
        -> Result<Account, ResolverError>;

    async fn get_account_by_id(&self, account_id: &str) -> Result<Account, ResolverError>;

    /// True when the franchise already has a registered owner, which blocks
    /// registering another one
    async fn owner_exists(&self, franchise_id: &str) -> Result<bool, ResolverError>;

    async fn health_check(&self) -> Result<(), String>;
}

/// Resolver implementation selected at boot
#[derive(Clone)]
pub enum Resolver {
    Postgres(postgres::PostgresResolver),
    Memory(memory::MemoryResolver),
}

#[async_trait]
impl SubjectResolver for Resolver {
    async fn get_account_role(
        &self,
        franchise_id: &str,
        account_id: &str,
    ) -> Result<AccountRole, ResolverError> {
        match self {
            Self::Postgres(resolver) => resolver.get_account_role(franchise_id, account_id).await,
            Self::Memory(resolver) => resolver.get_account_role(franchise_id, account_id).await,
        }
    }

    async fn get_role_permissions(&self, role_id: &str) -> Result<RolePermissions, ResolverError> {
        match self {
            Self::Postgres(resolver) => resolver.get_role_permissions(role_id).await,
            Self::Memory(resolver) => resolver.get_role_permissions(role_id).await,
        }
    }

    async fn get_direct_permissions(
        &self,
        account_id: &str,
    ) -> Result<DirectPermissions, ResolverError> {
        match self {
            Self::Postgres(resolver) => resolver.get_direct_permissions(account_id).await,
            Self::Memory(resolver) => resolver.get_direct_permissions(account_id).await,
        }
    }

    async fn get_user(
        &self,
        login_id: &str,
        account_type: &str,
    ) -> Result<Account, ResolverError> {
        match self {
            Self::Postgres(resolver) => resolver.get_user(login_id, account_type).await,
            Self::Memory(resolver) => resolver.get_user(login_id, account_type).await,
        }
    }

    async fn get_account_by_id(&self, account_id: &str) -> Result<Account, ResolverError> {
        match self {
            Self::Postgres(resolver) => resolver.get_account_by_id(account_id).await,
            Self::Memory(resolver) => resolver.get_account_by_id(account_id).await,
        }
    }

    async fn owner_exists(&self, franchise_id: &str) -> Result<bool, ResolverError> {
        match self {
            Self::Postgres(resolver) => resolver.owner_exists(franchise_id).await,
            Self::Memory(resolver) => resolver.owner_exists(franchise_id).await,
        }
    }

    async fn health_check(&self) -> Result<(), String> {
        match self {
            Self::Postgres(resolver) => resolver.health_check().await,
            Self::Memory(resolver) => resolver.health_check().await,
        }
    }
}
