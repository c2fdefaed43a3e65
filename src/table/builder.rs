//! SQL composition for table operations.
//!
//! Identifiers are always quoted, values are always bound as positional parameters.
//! The one exception is SQL `NULL` in insert and update payloads, which is written
//! literally so that it fits any column type without a parameter type.
//!
//! PostgreSQL types every parameter, and strings are sent as `text`. When the
//! column types of the table are known, string values are cast to their column's
//! type (`CAST($1 AS uuid)`) so uuid, timestamp, enum and array columns accept them.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam, Statement};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;

/// Column name to PostgreSQL type, as rendered by `format_type`.
pub type ColumnTypes = BTreeMap<String, String>;

/// Columns to return from a select or a RETURNING clause.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Selection {
    /// `*`
    #[default]
    All,
    Columns(Vec<String>),
}

impl Selection {
    /// Build a selection from column names.
    pub fn columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Columns(columns.into_iter().map(Into::into).collect())
    }

    /// Column names, or `None` for `*`.
    pub fn names(&self) -> Option<&[String]> {
        match self {
            Selection::All => None,
            Selection::Columns(cols) => Some(cols),
        }
    }

    fn render(&self) -> DbResult<String> {
        match self {
            Selection::All => Ok("*".to_string()),
            Selection::Columns(cols) if cols.is_empty() => Ok("*".to_string()),
            Selection::Columns(cols) => Ok(cols
                .iter()
                .map(|c| quote_ident(c))
                .collect::<DbResult<Vec<_>>>()?
                .join(", ")),
        }
    }
}

impl From<&str> for Selection {
    /// Parse `"*"` or a comma-separated column list such as `"id, first_name"`.
    fn from(s: &str) -> Self {
        let cols: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if cols.is_empty() || cols.iter().any(|c| c == "*") {
            Selection::All
        } else {
            Selection::Columns(cols)
        }
    }
}

impl From<String> for Selection {
    fn from(s: String) -> Self {
        Selection::from(s.as_str())
    }
}

impl From<Vec<String>> for Selection {
    fn from(cols: Vec<String>) -> Self {
        Selection::Columns(cols)
    }
}

impl From<&[&str]> for Selection {
    fn from(cols: &[&str]) -> Self {
        Selection::columns(cols.iter().copied())
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::All => f.write_str("*"),
            Selection::Columns(cols) => f.write_str(&cols.join(", ")),
        }
    }
}

/// A possibly schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub schema: Option<String>,
    pub table: String,
}

impl TableName {
    pub fn new(schema: Option<String>, table: impl Into<String>) -> Self {
        Self {
            schema,
            table: table.into(),
        }
    }

    pub(crate) fn render(&self) -> DbResult<String> {
        match &self.schema {
            Some(schema) => Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(&self.table)?)),
            None => quote_ident(&self.table),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => f.write_str(&self.table),
        }
    }
}

/// Quote an identifier with double quotes, doubling embedded quotes.
pub fn quote_ident(name: &str) -> DbResult<String> {
    if name.is_empty() {
        return Err(DbError::invalid_input("Identifier cannot be empty"));
    }
    if name.contains('\0') {
        return Err(DbError::invalid_input(format!(
            "Identifier contains a NUL character: {:?}",
            name
        )));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Statement listing the columns of `table` with their PostgreSQL types.
pub fn column_types(table: &TableName) -> DbResult<Statement> {
    Ok(Statement::new(
        "SELECT a.attname::text AS name, format_type(a.atttypid, a.atttypmod) AS data_type \
         FROM pg_catalog.pg_attribute a \
         WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped",
    )
    .with_param(table.render()?))
}

/// Text columns take a `text` parameter as is; a cast could truncate `varchar(n)`.
fn is_character_type(ty: &str) -> bool {
    ty == "text" || (ty.starts_with("character") && !ty.ends_with("[]"))
}

/// PostgreSQL array literal such as `{"a","b",NULL}`.
fn array_literal(items: &[JsonValue]) -> String {
    let elements: Vec<String> = items
        .iter()
        .map(|item| match item {
            JsonValue::Null => "NULL".to_string(),
            JsonValue::Array(inner) => array_literal(inner),
            JsonValue::String(s) => quote_array_element(s),
            JsonValue::Object(_) => quote_array_element(&item.to_string()),
            other => other.to_string(),
        })
        .collect();
    format!("{{{}}}", elements.join(","))
}

fn quote_array_element(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Accumulates positional parameters while SQL text is written.
struct Binder<'a> {
    dialect: DatabaseType,
    types: Option<&'a ColumnTypes>,
    params: Vec<QueryParam>,
}

impl<'a> Binder<'a> {
    fn new(dialect: DatabaseType, types: Option<&'a ColumnTypes>) -> Self {
        Self {
            dialect,
            types,
            params: Vec::new(),
        }
    }

    /// Bind `value` for `column` and return its placeholder.
    fn bind(&mut self, column: &str, value: &JsonValue) -> String {
        let column_type = self.types.and_then(|types| types.get(column));
        let param = match (column_type, value) {
            (Some(ty), JsonValue::Array(items)) if ty.ends_with("[]") => {
                QueryParam::String(array_literal(items))
            }
            _ => QueryParam::from(value),
        };
        let is_string = matches!(param, QueryParam::String(_));
        self.params.push(param);

        let placeholder = self.dialect.placeholder(self.params.len());
        match column_type {
            Some(ty) if is_string && !is_character_type(ty) => {
                format!("CAST({} AS {})", placeholder, ty)
            }
            _ => placeholder,
        }
    }

    /// Placeholder for a payload value; NULL is written literally.
    fn bind_value(&mut self, column: &str, value: &JsonValue) -> String {
        if value.is_null() {
            "NULL".to_string()
        } else {
            self.bind(column, value)
        }
    }

    /// `WHERE a = $1 AND b IS NULL`, or nothing for an empty filter.
    fn where_clause(&mut self, filter: &Map<String, JsonValue>) -> DbResult<String> {
        if filter.is_empty() {
            return Ok(String::new());
        }
        let mut conditions = Vec::with_capacity(filter.len());
        for (column, value) in filter {
            let quoted = quote_ident(column)?;
            if value.is_null() {
                conditions.push(format!("{} IS NULL", quoted));
            } else {
                let placeholder = self.bind(column, value);
                conditions.push(format!("{} = {}", quoted, placeholder));
            }
        }
        Ok(format!(" WHERE {}", conditions.join(" AND ")))
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            params: self.params,
        }
    }
}

fn returning_clause(returning: Option<&Selection>) -> DbResult<String> {
    match returning {
        Some(selection) => Ok(format!(" RETURNING {}", selection.render()?)),
        None => Ok(String::new()),
    }
}

/// `INSERT INTO t (a, b) VALUES ($1, $2) [RETURNING ...]`
pub fn insert(
    dialect: DatabaseType,
    types: Option<&ColumnTypes>,
    table: &TableName,
    data: &Map<String, JsonValue>,
    returning: Option<&Selection>,
) -> DbResult<Statement> {
    let mut binder = Binder::new(dialect, types);
    let mut sql = format!("INSERT INTO {}", table.render()?);

    if data.is_empty() {
        sql.push_str(" DEFAULT VALUES");
    } else {
        let mut columns = Vec::with_capacity(data.len());
        let mut values = Vec::with_capacity(data.len());
        for (column, value) in data {
            columns.push(quote_ident(column)?);
            values.push(binder.bind_value(column, value));
        }
        sql.push_str(&format!(
            " ({}) VALUES ({})",
            columns.join(", "),
            values.join(", ")
        ));
    }

    sql.push_str(&returning_clause(returning)?);
    Ok(binder.finish(sql))
}

/// `SELECT cols FROM t [WHERE ...] [LIMIT n]`
pub fn select(
    dialect: DatabaseType,
    types: Option<&ColumnTypes>,
    table: &TableName,
    filter: &Map<String, JsonValue>,
    columns: &Selection,
    limit: Option<u64>,
) -> DbResult<Statement> {
    let mut binder = Binder::new(dialect, types);
    let mut sql = format!("SELECT {} FROM {}", columns.render()?, table.render()?);
    sql.push_str(&binder.where_clause(filter)?);
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    Ok(binder.finish(sql))
}

/// `UPDATE t SET a = $1 [WHERE ...] [RETURNING ...]`
pub fn update(
    dialect: DatabaseType,
    types: Option<&ColumnTypes>,
    table: &TableName,
    filter: &Map<String, JsonValue>,
    data: &Map<String, JsonValue>,
    returning: Option<&Selection>,
) -> DbResult<Statement> {
    if data.is_empty() {
        return Err(DbError::invalid_input(format!(
            "Update of {} needs at least one column to set",
            table
        )));
    }

    let mut binder = Binder::new(dialect, types);
    let mut assignments = Vec::with_capacity(data.len());
    for (column, value) in data {
        let placeholder = binder.bind_value(column, value);
        assignments.push(format!("{} = {}", quote_ident(column)?, placeholder));
    }

    let mut sql = format!(
        "UPDATE {} SET {}",
        table.render()?,
        assignments.join(", ")
    );
    sql.push_str(&binder.where_clause(filter)?);
    sql.push_str(&returning_clause(returning)?);
    Ok(binder.finish(sql))
}

/// `DELETE FROM t [WHERE ...] [RETURNING ...]`
pub fn delete(
    dialect: DatabaseType,
    types: Option<&ColumnTypes>,
    table: &TableName,
    filter: &Map<String, JsonValue>,
    returning: Option<&Selection>,
) -> DbResult<Statement> {
    let mut binder = Binder::new(dialect, types);
    let mut sql = format!("DELETE FROM {}", table.render()?);
    sql.push_str(&binder.where_clause(filter)?);
    sql.push_str(&returning_clause(returning)?);
    Ok(binder.finish(sql))
}
