use super::query::{Allowlist, ColumnRef, Join, JoinKind, Param, Query, QueryError, Select};
use super::{
    Account, AccountRole, AccountStatus, DirectPermissions, ResolverError, RolePermissions,
    SubjectResolver, permission_key,
};
use crate::config::DatabaseConfig;
use crate::validation;
use async_trait::async_trait;
use log::info;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions};
use sqlx::query::QueryAs;
use sqlx::{FromRow, PgPool, Postgres};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

const SCHEMAS: &[&str] = &["public", "franchise", "auth"];
const ACCOUNTS: &[&str] = &[
    "id",
    "franchise_id",
    "employee_id",
    "login_id",
    "password_hash",
    "account_type",
    "name",
    "mobile_no",
    "email",
    "role_id",
    "status",
];
const ROLES: &[&str] = &["id", "franchise_id", "name", "description", "is_default"];
const PERMISSIONS: &[&str] = &["id", "resource", "action"];
const ROLE_PERMISSIONS: &[&str] = &["role_id", "permission_id"];
const DIRECT_PERMISSIONS: &[&str] = &["account_id", "permission_id", "is_granted"];
const FRANCHISE_OWNERS: &[&str] = &["id", "franchise_id", "account_id"];

fn allowlist() -> Allowlist {
    Allowlist::new(
        SCHEMAS,
        &[
            ("accounts", ACCOUNTS),
            ("roles", ROLES),
            ("permissions", PERMISSIONS),
            ("role_permissions", ROLE_PERMISSIONS),
            ("direct_permissions", DIRECT_PERMISSIONS),
            ("franchise_owners", FRANCHISE_OWNERS),
        ],
    )
}

#[derive(Debug, FromRow)]
struct DbAccount {
    id: Uuid,
    franchise_id: Uuid,
    employee_id: String,
    login_id: String,
    password_hash: String,
    account_type: String,
    name: String,
    mobile_no: String,
    email: String,
    role_id: Uuid,
    status: String,
}

impl TryFrom<DbAccount> for Account {
    type Error = ResolverError;

    fn try_from(row: DbAccount) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id.to_string(),
            franchise_id: row.franchise_id.to_string(),
            employee_id: row.employee_id,
            login_id: row.login_id,
            password_hash: row.password_hash,
            account_type: row.account_type,
            name: row.name,
            mobile_no: row.mobile_no,
            email: row.email,
            role_id: row.role_id.to_string(),
            status: AccountStatus::from_str(&row.status)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct DbAccountRole {
    id: Uuid,
    franchise_id: Uuid,
    role_id: Uuid,
    account_type: String,
}

#[derive(Debug, FromRow)]
struct DbPermission {
    resource: String,
    action: String,
}

#[derive(Debug, FromRow)]
struct DbDirectPermission {
    resource: String,
    action: String,
    is_granted: bool,
}

/// Subject store backed by Postgres. Every statement goes through the
/// allowlisted query composer.
#[derive(Clone)]
pub struct PostgresResolver {
    pool: PgPool,
    schema: String,
    allowlist: Arc<Allowlist>,
}

impl PostgresResolver {
    /// Build a lazily connecting pool; connection failures surface on first use
    /// and through the health check.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self, ResolverError> {
        let allowlist = allowlist();
        if !SCHEMAS.contains(&config.schema.as_str()) {
            return Err(QueryError::Schema(config.schema.clone()).into());
        }
        // Avoid logging the URL; it may carry credentials
        let options = PgConnectOptions::from_str(&config.url)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy_with(options);
        info!(
            "Configured Postgres subject resolver (schema {}, max {} connections)",
            config.schema, config.max_connections
        );
        Ok(Self {
            pool,
            schema: config.schema.clone(),
            allowlist: Arc::new(allowlist),
        })
    }

    fn select(
        &self,
        table: &str,
        alias: &str,
        columns: &[&str],
        joins: Vec<Join>,
        filters: Vec<(&str, Param)>,
        limit: Option<u32>,
    ) -> Result<Query, ResolverError> {
        let columns = columns
            .iter()
            .map(|column| ColumnRef::parse(column))
            .collect::<Result<Vec<_>, _>>()?;
        let filters = filters
            .into_iter()
            .map(|(column, param)| ColumnRef::parse(column).map(|column| (column, param)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.allowlist.select(&Select {
            schema: self.schema.clone(),
            table: table.to_string(),
            alias: alias.to_string(),
            columns,
            joins,
            filters,
            limit,
        })?)
    }

    fn join(&self, table: &str, alias: &str, left: &str, right: &str) -> Result<Join, ResolverError> {
        Ok(Join {
            kind: JoinKind::Inner,
            schema: self.schema.clone(),
            table: table.to_string(),
            alias: alias.to_string(),
            on: (ColumnRef::parse(left)?, ColumnRef::parse(right)?),
        })
    }

    async fn fetch_all<T>(&self, query: &Query) -> Result<Vec<T>, ResolverError>
    where
        T: for<'r> FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
    {
        let rows = bind(sqlx::query_as::<_, T>(&query.sql), &query.params)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn fetch_optional<T>(&self, query: &Query) -> Result<Option<T>, ResolverError>
    where
        T: for<'r> FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
    {
        let row = bind(sqlx::query_as::<_, T>(&query.sql), &query.params)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn fetch_account(&self, filters: Vec<(&str, Param)>) -> Result<Account, ResolverError> {
        let columns: Vec<String> = ACCOUNTS.iter().map(|column| format!("a.{}", column)).collect();
        let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
        let query = self.select("accounts", "a", &columns, vec![], filters, Some(1))?;
        self.fetch_optional::<DbAccount>(&query)
            .await?
            .ok_or(ResolverError::NotFound)?
            .try_into()
    }
}

fn bind<'q, O>(
    mut query: QueryAs<'q, Postgres, O, PgArguments>,
    params: &'q [Param],
) -> QueryAs<'q, Postgres, O, PgArguments> {
    for param in params {
        query = match param {
            Param::Text(value) => query.bind(value.as_str()),
            Param::Uuid(value) => query.bind(*value),
            Param::Bool(value) => query.bind(*value),
            Param::Int(value) => query.bind(*value),
        };
    }
    query
}

/// Identifiers are UUIDs; anything else cannot match a row
fn parse_id(id: &str) -> Result<Uuid, ResolverError> {
    validation::parse_uuid(id, "id").map_err(|_| ResolverError::NotFound)
}

#[async_trait]
impl SubjectResolver for PostgresResolver {
    async fn get_account_role(
        &self,
        franchise_id: &str,
        account_id: &str,
    ) -> Result<AccountRole, ResolverError> {
        let query = self.select(
            "accounts",
            "a",
            &["a.id", "a.franchise_id", "a.role_id", "a.account_type"],
            vec![],
            vec![
                ("a.id", Param::Uuid(parse_id(account_id)?)),
                ("a.franchise_id", Param::Uuid(parse_id(franchise_id)?)),
            ],
            Some(1),
        )?;
        let row = self
            .fetch_optional::<DbAccountRole>(&query)
            .await?
            .ok_or(ResolverError::NotFound)?;
        Ok(AccountRole {
            account_id: row.id.to_string(),
            franchise_id: row.franchise_id.to_string(),
            role_id: row.role_id.to_string(),
            account_type: row.account_type,
        })
    }

    async fn get_role_permissions(&self, role_id: &str) -> Result<RolePermissions, ResolverError> {
        let query = self.select(
            "role_permissions",
            "rp",
            &["p.resource", "p.action"],
            vec![self.join("permissions", "p", "rp.permission_id", "p.id")?],
            vec![("rp.role_id", Param::Uuid(parse_id(role_id)?))],
            None,
        )?;
        let mut permissions = RolePermissions::new();
        for row in self.fetch_all::<DbPermission>(&query).await? {
            permissions.entry(row.resource).or_default().insert(row.action);
        }
        Ok(permissions)
    }

    async fn get_direct_permissions(
        &self,
        account_id: &str,
    ) -> Result<DirectPermissions, ResolverError> {
        let query = self.select(
            "direct_permissions",
            "dp",
            &["p.resource", "p.action", "dp.is_granted"],
            vec![self.join("permissions", "p", "dp.permission_id", "p.id")?],
            vec![("dp.account_id", Param::Uuid(parse_id(account_id)?))],
            None,
        )?;
        Ok(self
            .fetch_all::<DbDirectPermission>(&query)
            .await?
            .into_iter()
            .map(|row| (permission_key(&row.resource, &row.action), row.is_granted))
            .collect())
    }

    async fn get_user(
        &self,
        login_id: &str,
        account_type: &str,
    ) -> Result<Account, ResolverError> {
        self.fetch_account(vec![
            ("a.login_id", Param::Text(login_id.to_string())),
            ("a.account_type", Param::Text(account_type.to_string())),
        ])
        .await
    }

    async fn get_account_by_id(&self, account_id: &str) -> Result<Account, ResolverError> {
        self.fetch_account(vec![("a.id", Param::Uuid(parse_id(account_id)?))])
            .await
    }

    async fn owner_exists(&self, franchise_id: &str) -> Result<bool, ResolverError> {
        let franchise_id = match validation::parse_uuid(franchise_id, "franchiseID") {
            Ok(id) => id,
            Err(_) => return Ok(false),
        };
        let query = self.select(
            "franchise_owners",
            "o",
            &["o.id"],
            vec![],
            vec![("o.franchise_id", Param::Uuid(franchise_id))],
            Some(1),
        )?;
        Ok(self.fetch_optional::<(Uuid,)>(&query).await?.is_some())
    }

    async fn health_check(&self) -> Result<(), String> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| format!("Postgres health check failed: {}", err))
    }
}
