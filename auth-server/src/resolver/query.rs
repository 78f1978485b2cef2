use std::collections::HashMap;
use std::fmt::Write;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Schema {0} is not allowed")]
    Schema(String),
    #[error("Table {0} is not allowed")]
    Table(String),
    #[error("Column {column} is not allowed on {table}")]
    Column { table: String, column: String },
    #[error("Unknown table alias {0}")]
    Alias(String),
    #[error("Malformed column reference {0}")]
    Reference(String),
    #[error("Query needs at least one {0}")]
    Empty(&'static str),
}

/// A literal bound to a `$n` placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Text(String),
    Uuid(Uuid),
    Bool(bool),
    Int(i64),
}

/// Composed statement and its placeholder values, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub sql: String,
    pub params: Vec<Param>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    fn keyword(&self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
        }
    }
}

/// `alias.column`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub alias: String,
    pub column: String,
}

impl ColumnRef {
    pub fn parse(reference: &str) -> Result<Self, QueryError> {
        match reference.split_once('.') {
            Some((alias, column)) if !alias.is_empty() && !column.is_empty() => Ok(Self {
                alias: alias.to_string(),
                column: column.to_string(),
            }),
            _ => Err(QueryError::Reference(reference.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Join {
    pub kind: JoinKind,
    pub schema: String,
    pub table: String,
    pub alias: String,
    /// Equality between a column already in scope and one of the joined table
    pub on: (ColumnRef, ColumnRef),
}

/// A SELECT over one base table with optional joins and equality filters
#[derive(Debug, Clone)]
pub struct Select {
    pub schema: String,
    pub table: String,
    pub alias: String,
    pub columns: Vec<ColumnRef>,
    pub joins: Vec<Join>,
    pub filters: Vec<(ColumnRef, Param)>,
    pub limit: Option<u32>,
}

/// Identifiers every composed query is checked against. Nothing a caller
/// passes reaches identifier position without matching an entry here.
#[derive(Debug, Clone)]
pub struct Allowlist {
    schemas: Vec<&'static str>,
    tables: HashMap<&'static str, &'static [&'static str]>,
}

impl Allowlist {
    pub fn new(
        schemas: &[&'static str],
        tables: &[(&'static str, &'static [&'static str])],
    ) -> Self {
        Self {
            schemas: schemas.to_vec(),
            tables: tables.iter().copied().collect(),
        }
    }

    fn schema(&self, schema: &str) -> Result<(), QueryError> {
        if self.schemas.contains(&schema) {
            Ok(())
        } else {
            Err(QueryError::Schema(schema.to_string()))
        }
    }

    fn columns(&self, table: &str) -> Result<&'static [&'static str], QueryError> {
        self.tables
            .get(table)
            .copied()
            .ok_or_else(|| QueryError::Table(table.to_string()))
    }

    fn column(&self, table: &str, column: &str) -> Result<(), QueryError> {
        if self.columns(table)?.contains(&column) {
            Ok(())
        } else {
            Err(QueryError::Column {
                table: table.to_string(),
                column: column.to_string(),
            })
        }
    }

    pub fn select(&self, select: &Select) -> Result<Query, QueryError> {
        if select.columns.is_empty() {
            return Err(QueryError::Empty("column"));
        }
        self.schema(&select.schema)?;
        self.columns(&select.table)?;
        check_alias(&select.alias)?;

        // alias -> table, for every table in scope
        let mut scope: HashMap<&str, &str> = HashMap::new();
        scope.insert(select.alias.as_str(), select.table.as_str());
        let resolve = |scope: &HashMap<&str, &str>, column: &ColumnRef| -> Result<(), QueryError> {
            let table = scope
                .get(column.alias.as_str())
                .ok_or_else(|| QueryError::Alias(column.alias.clone()))?;
            self.column(table, &column.column)
        };

        let mut joins = String::new();
        for join in &select.joins {
            self.schema(&join.schema)?;
            self.columns(&join.table)?;
            check_alias(&join.alias)?;
            scope.insert(join.alias.as_str(), join.table.as_str());
            resolve(&scope, &join.on.0)?;
            resolve(&scope, &join.on.1)?;
            let _ = write!(
                joins,
                " {} {} AS {} ON {} = {}",
                join.kind.keyword(),
                qualified(&join.schema, &join.table),
                quote(&join.alias),
                column_sql(&join.on.0),
                column_sql(&join.on.1)
            );
        }

        let mut columns = Vec::with_capacity(select.columns.len());
        for column in &select.columns {
            resolve(&scope, column)?;
            columns.push(column_sql(column));
        }

        let mut sql = format!(
            "SELECT {} FROM {} AS {}{}",
            columns.join(", "),
            qualified(&select.schema, &select.table),
            quote(&select.alias),
            joins
        );

        let mut params = Vec::with_capacity(select.filters.len());
        for (index, (column, param)) in select.filters.iter().enumerate() {
            resolve(&scope, column)?;
            let keyword = if index == 0 { " WHERE" } else { " AND" };
            let _ = write!(sql, "{} {} = ${}", keyword, column_sql(column), index + 1);
            params.push(param.clone());
        }

        if let Some(limit) = select.limit {
            let _ = write!(sql, " LIMIT {}", limit);
        }

        Ok(Query { sql, params })
    }

    pub fn insert(
        &self,
        schema: &str,
        table: &str,
        values: &[(&str, Param)],
    ) -> Result<Query, QueryError> {
        if values.is_empty() {
            return Err(QueryError::Empty("value"));
        }
        self.schema(schema)?;
        let mut columns = Vec::with_capacity(values.len());
        let mut placeholders = Vec::with_capacity(values.len());
        let mut params = Vec::with_capacity(values.len());
        for (index, (column, param)) in values.iter().enumerate() {
            self.column(table, column)?;
            columns.push(quote(column));
            placeholders.push(format!("${}", index + 1));
            params.push(param.clone());
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            qualified(schema, table),
            columns.join(", "),
            placeholders.join(", ")
        );
        Ok(Query { sql, params })
    }

    pub fn update(
        &self,
        schema: &str,
        table: &str,
        set: &[(&str, Param)],
        filters: &[(&str, Param)],
    ) -> Result<Query, QueryError> {
        if set.is_empty() {
            return Err(QueryError::Empty("assignment"));
        }
        // An unfiltered UPDATE would rewrite the whole table
        if filters.is_empty() {
            return Err(QueryError::Empty("filter"));
        }
        self.schema(schema)?;

        let mut params = Vec::with_capacity(set.len() + filters.len());
        let mut assignments = Vec::with_capacity(set.len());
        for (column, param) in set {
            self.column(table, column)?;
            params.push(param.clone());
            assignments.push(format!("{} = ${}", quote(column), params.len()));
        }
        let mut conditions = Vec::with_capacity(filters.len());
        for (column, param) in filters {
            self.column(table, column)?;
            params.push(param.clone());
            conditions.push(format!("{} = ${}", quote(column), params.len()));
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            qualified(schema, table),
            assignments.join(", "),
            conditions.join(" AND ")
        );
        Ok(Query { sql, params })
    }
}

/// Aliases are free-form but must be plain identifiers
fn check_alias(alias: &str) -> Result<(), QueryError> {
    let valid = !alias.is_empty()
        && alias.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !alias.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(QueryError::Alias(alias.to_string()))
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier)
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote(schema), quote(table))
}

fn column_sql(column: &ColumnRef) -> String {
    format!("{}.{}", quote(&column.alias), quote(&column.column))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNTS: &[&str] = &["id", "franchise_id", "role_id", "login_id"];
    const ROLES: &[&str] = &["id", "name"];

    fn allowlist() -> Allowlist {
        Allowlist::new(&["public"], &[("accounts", ACCOUNTS), ("roles", ROLES)])
    }

    fn col(reference: &str) -> ColumnRef {
        ColumnRef::parse(reference).unwrap()
    }

    #[test]
    fn test_select_with_join() {
        let id = Uuid::new_v4();
        let query = allowlist()
            .select(&Select {
                schema: "public".to_string(),
                table: "accounts".to_string(),
                alias: "a".to_string(),
                columns: vec![col("a.id"), col("r.name")],
                joins: vec![Join {
                    kind: JoinKind::Inner,
                    schema: "public".to_string(),
                    table: "roles".to_string(),
                    alias: "r".to_string(),
                    on: (col("a.role_id"), col("r.id")),
                }],
                filters: vec![
                    (col("a.id"), Param::Uuid(id)),
                    (col("a.login_id"), Param::Text("owner".to_string())),
                ],
                limit: Some(1),
            })
            .unwrap();

        assert_eq!(
            query.sql,
            "SELECT \"a\".\"id\", \"r\".\"name\" FROM \"public\".\"accounts\" AS \"a\" \
             INNER JOIN \"public\".\"roles\" AS \"r\" ON \"a\".\"role_id\" = \"r\".\"id\" \
             WHERE \"a\".\"id\" = $1 AND \"a\".\"login_id\" = $2 LIMIT 1"
        );
        assert_eq!(
            query.params,
            vec![Param::Uuid(id), Param::Text("owner".to_string())]
        );
    }

    #[test]
    fn test_identifiers_outside_allowlist_are_rejected() {
        let base = Select {
            schema: "public".to_string(),
            table: "accounts".to_string(),
            alias: "a".to_string(),
            columns: vec![col("a.id")],
            joins: vec![],
            filters: vec![],
            limit: None,
        };
        let list = allowlist();

        let mut select = base.clone();
        select.schema = "pg_catalog".to_string();
        assert_eq!(
            list.select(&select),
            Err(QueryError::Schema("pg_catalog".to_string()))
        );

        let mut select = base.clone();
        select.columns = vec![col("a.password_hash")];
        assert!(matches!(list.select(&select), Err(QueryError::Column { .. })));

        let mut select = base.clone();
        select.columns = vec![col("x.id")];
        assert_eq!(list.select(&select), Err(QueryError::Alias("x".to_string())));

        let mut select = base;
        select.alias = "a\"; DROP TABLE accounts; --".to_string();
        assert!(matches!(list.select(&select), Err(QueryError::Alias(_))));

        assert!(ColumnRef::parse("id").is_err());
    }

    #[test]
    fn test_insert_and_update() {
        let list = allowlist();
        let insert = list
            .insert(
                "public",
                "roles",
                &[("id", Param::Int(1)), ("name", Param::Text("admin".to_string()))],
            )
            .unwrap();
        assert_eq!(
            insert.sql,
            "INSERT INTO \"public\".\"roles\" (\"id\", \"name\") VALUES ($1, $2)"
        );
        assert_eq!(insert.params.len(), 2);

        let update = list
            .update(
                "public",
                "roles",
                &[("name", Param::Text("owner".to_string()))],
                &[("id", Param::Int(1))],
            )
            .unwrap();
        assert_eq!(
            update.sql,
            "UPDATE \"public\".\"roles\" SET \"name\" = $1 WHERE \"id\" = $2"
        );
        assert_eq!(
            update.params,
            vec![Param::Text("owner".to_string()), Param::Int(1)]
        );

        assert_eq!(
            list.update("public", "roles", &[("name", Param::Bool(true))], &[]),
            Err(QueryError::Empty("filter"))
        );
        assert!(matches!(
            list.insert("public", "roles", &[("is_admin", Param::Bool(true))]),
            Err(QueryError::Column { .. })
        ));
    }
}
