use super::{
    permission_key, Account, AccountRole, AccountStatus, DirectPermissions, ResolverError,
    RolePermissions, SubjectResolver,
};
use async_trait::async_trait;
use log::info;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct Data {
    accounts: HashMap<String, Account>,
    role_permissions: HashMap<String, RolePermissions>,
    direct_permissions: HashMap<String, DirectPermissions>,
    owners: HashSet<String>,
}

/// Number of lookups served, per operation
#[derive(Debug, Default)]
pub struct CallCounts {
    pub account_role: AtomicU64,
    pub role_permissions: AtomicU64,
    pub direct_permissions: AtomicU64,
    pub user: AtomicU64,
}

impl CallCounts {
    pub fn permission_fetches(&self) -> u64 {
        self.role_permissions.load(Ordering::SeqCst) + self.direct_permissions.load(Ordering::SeqCst)
    }
}

/// Accounts and permissions loaded into the in-memory store at startup
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Seed {
    accounts: Vec<SeedAccount>,
    /// role id -> resource -> actions
    role_grants: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    direct: Vec<SeedDirect>,
    owners: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedAccount {
    id: String,
    #[serde(rename = "franchiseID")]
    franchise_id: String,
    #[serde(rename = "employeeID", default)]
    employee_id: String,
    #[serde(rename = "loginID")]
    login_id: String,
    /// bcrypt hash
    password_hash: String,
    account_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mobile_no: String,
    #[serde(default)]
    email: String,
    #[serde(rename = "roleID")]
    role_id: String,
    #[serde(default = "active")]
    status: String,
}

fn active() -> String {
    AccountStatus::Active.to_string()
}

#[derive(Debug, Deserialize)]
struct SeedDirect {
    #[serde(rename = "accountID")]
    account_id: String,
    resource: String,
    action: String,
    granted: bool,
}

/// Subject store held in memory, used for local development and tests.
#[derive(Clone, Default)]
pub struct MemoryResolver {
    data: Arc<RwLock<Data>>,
    calls: Arc<CallCounts>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load accounts, grants and owners from a YAML seed file
    pub fn from_seed_file(path: &Path) -> Result<Self, ResolverError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ResolverError::Seed(format!("{}: {}", path.display(), err)))?;
        let resolver = Self::from_seed_yaml(&contents)?;
        info!("Seeded in-memory subject store from {}", path.display());
        Ok(resolver)
    }

    fn from_seed_yaml(contents: &str) -> Result<Self, ResolverError> {
        let seed: Seed =
            serde_yaml::from_str(contents).map_err(|err| ResolverError::Seed(err.to_string()))?;
        let resolver = Self::new();

        for account in seed.accounts {
            let status = account
                .status
                .parse::<AccountStatus>()
                .map_err(|_| ResolverError::Seed(format!("account {} status", account.id)))?;
            resolver.add_account(Account {
                id: account.id,
                franchise_id: account.franchise_id,
                employee_id: account.employee_id,
                login_id: account.login_id,
                password_hash: account.password_hash,
                account_type: account.account_type,
                name: account.name,
                mobile_no: account.mobile_no,
                email: account.email,
                role_id: account.role_id,
                status,
            });
        }
        for (role_id, grants) in &seed.role_grants {
            for (resource, actions) in grants {
                for action in actions {
                    resolver.grant_role(role_id, resource, action);
                }
            }
        }
        for direct in &seed.direct {
            resolver.set_direct(
                &direct.account_id,
                &direct.resource,
                &direct.action,
                direct.granted,
            );
        }
        for owner in &seed.owners {
            resolver.add_owner(owner);
        }
        Ok(resolver)
    }

    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    pub fn add_account(&self, account: Account) {
        if let Ok(mut data) = self.data.write() {
            data.accounts.insert(account.id.clone(), account);
        }
    }

    pub fn grant_role(&self, role_id: &str, resource: &str, action: &str) {
        if let Ok(mut data) = self.data.write() {
            data.role_permissions
                .entry(role_id.to_string())
                .or_default()
                .entry(resource.to_string())
                .or_default()
                .insert(action.to_string());
        }
    }

    /// Record a per-account override; `granted = false` is an explicit deny
    pub fn set_direct(&self, account_id: &str, resource: &str, action: &str, granted: bool) {
        if let Ok(mut data) = self.data.write() {
            data.direct_permissions
                .entry(account_id.to_string())
                .or_default()
                .insert(permission_key(resource, action), granted);
        }
    }

    pub fn add_owner(&self, franchise_id: &str) {
        if let Ok(mut data) = self.data.write() {
            data.owners.insert(franchise_id.to_string());
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Data) -> T) -> Result<T, ResolverError> {
        let data = self
            .data
            .read()
            .map_err(|_| ResolverError::Corrupt("resolver lock poisoned".to_string()))?;
        Ok(f(&data))
    }
}

#[async_trait]
impl SubjectResolver for MemoryResolver {
    async fn get_account_role(
        &self,
        franchise_id: &str,
        account_id: &str,
    ) -> Result<AccountRole, ResolverError> {
        self.calls.account_role.fetch_add(1, Ordering::SeqCst);
        self.read(|data| {
            data.accounts
                .get(account_id)
                .filter(|account| account.franchise_id == franchise_id)
                .map(|account| AccountRole {
                    account_id: account.id.clone(),
                    franchise_id: account.franchise_id.clone(),
                    role_id: account.role_id.clone(),
                    account_type: account.account_type.clone(),
                })
        })?
        .ok_or(ResolverError::NotFound)
    }

    async fn get_role_permissions(&self, role_id: &str) -> Result<RolePermissions, ResolverError> {
        self.calls.role_permissions.fetch_add(1, Ordering::SeqCst);
        self.read(|data| {
            data.role_permissions
                .get(role_id)
                .cloned()
                .unwrap_or_default()
        })
    }

    async fn get_direct_permissions(
        &self,
        account_id: &str,
    ) -> Result<DirectPermissions, ResolverError> {
        self.calls.direct_permissions.fetch_add(1, Ordering::SeqCst);
        self.read(|data| {
            data.direct_permissions
                .get(account_id)
                .cloned()
                .unwrap_or_default()
        })
    }

    async fn get_user(
        &self,
        login_id: &str,
        account_type: &str,
    ) -> Result<Account, ResolverError> {
        self.calls.user.fetch_add(1, Ordering::SeqCst);
        self.read(|data| {
            data.accounts
                .values()
                .find(|account| account.login_id == login_id && account.account_type == account_type)
                .cloned()
        })?
        .ok_or(ResolverError::NotFound)
    }

    async fn get_account_by_id(&self, account_id: &str) -> Result<Account, ResolverError> {
        self.read(|data| data.accounts.get(account_id).cloned())?
            .ok_or(ResolverError::NotFound)
    }

    async fn owner_exists(&self, franchise_id: &str) -> Result<bool, ResolverError> {
        self.read(|data| data.owners.contains(franchise_id))
    }

    async fn health_check(&self) -> Result<(), String> {
        Ok(())
    }
}
