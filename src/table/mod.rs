//! Per-table models.
//!
//! A `Model` names one table (optionally inside a schema) and turns JSON payloads
//! and equality filters into statements. Each operation runs on the shared pool, or
//! on a transaction's connection when one is passed in.
//!
//! On PostgreSQL the table's column types are read from the catalog on first use
//! and cached on the model, so string values can be cast to their column's type.

pub mod builder;

use crate::db::{Database, Transaction};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Row, Statement, StatementResult};
use serde_json::{Map, Value as JsonValue};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

pub use builder::{ColumnTypes, Selection, TableName};

/// Insert, select, update and delete on one table.
///
/// Cloning is cheap; clones share the database handle.
#[derive(Debug, Clone)]
pub struct Model {
    db: Database,
    name: TableName,
    /// Known columns; `None` accepts any column name
    columns: Option<Arc<BTreeSet<String>>>,
    /// PostgreSQL column types, shared between clones
    column_types: Arc<OnceCell<Arc<ColumnTypes>>>,
}

impl Model {
    /// Model for `table` without a schema qualifier.
    pub fn new(db: Database, table: impl Into<String>) -> Self {
        Self {
            db,
            name: TableName::new(None, table),
            columns: None,
            column_types: Arc::default(),
        }
    }

    /// Model for `schema.table`.
    pub fn in_schema(db: Database, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            db,
            name: TableName::new(Some(schema.into()), table),
            columns: None,
            column_types: Arc::default(),
        }
    }

    /// Restrict payloads, filters and selections to the given columns.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(Arc::new(columns.into_iter().map(Into::into).collect()));
        self
    }

    pub fn name(&self) -> &TableName {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.name.table
    }

    pub fn schema(&self) -> Option<&str> {
        self.name.schema.as_deref()
    }

    /// Insert one row built from the fields of `data`.
    ///
    /// Returns the inserted row when `returning` is set, otherwise an empty list.
    pub async fn insert(
        &self,
        data: &JsonValue,
        returning: Option<Selection>,
        tx: Option<&mut Transaction>,
    ) -> DbResult<Vec<Row>> {
        let data = self.object(data, "insert payload")?;
        self.check_columns(data.keys())?;
        self.check_selection(returning.as_ref())?;

        let result = self
            .run(tx, |dialect, types| {
                builder::insert(dialect, types, &self.name, &data, returning.as_ref())
            })
            .await?;
        Ok(result.into_rows())
    }

    /// All rows matching `filter`. An empty or null filter selects every row.
    pub async fn select(
        &self,
        filter: &JsonValue,
        columns: Selection,
        tx: Option<&mut Transaction>,
    ) -> DbResult<Vec<Row>> {
        self.fetch(filter, &columns, None, tx).await
    }

    /// First row matching `filter`, or `None` when nothing matches.
    pub async fn select_one(
        &self,
        filter: &JsonValue,
        columns: Selection,
        tx: Option<&mut Transaction>,
    ) -> DbResult<Option<Row>> {
        let rows = self.fetch(filter, &columns, Some(1), tx).await?;
        Ok(rows.into_iter().next())
    }

    /// Set the fields of `data` on every row matching `filter`.
    pub async fn update(
        &self,
        filter: &JsonValue,
        data: &JsonValue,
        returning: Option<Selection>,
        tx: Option<&mut Transaction>,
    ) -> DbResult<Vec<Row>> {
        let filter = self.object(filter, "filter")?;
        let data = self.object(data, "update payload")?;
        self.check_columns(filter.keys().chain(data.keys()))?;
        self.check_selection(returning.as_ref())?;

        if filter.is_empty() {
            warn!(table = %self.name, "Update without filter affects every row");
        }

        let result = self
            .run(tx, |dialect, types| {
                builder::update(dialect, types, &self.name, &filter, &data, returning.as_ref())
            })
            .await?;
        Ok(result.into_rows())
    }

    /// Delete every row matching `filter`. An empty filter deletes the whole table.
    pub async fn delete(
        &self,
        filter: &JsonValue,
        returning: Option<Selection>,
        tx: Option<&mut Transaction>,
    ) -> DbResult<Vec<Row>> {
        let filter = self.object(filter, "filter")?;
        self.check_columns(filter.keys())?;
        self.check_selection(returning.as_ref())?;

        if filter.is_empty() {
            warn!(table = %self.name, "Delete without filter removes every row");
        }

        let result = self
            .run(tx, |dialect, types| {
                builder::delete(dialect, types, &self.name, &filter, returning.as_ref())
            })
            .await?;
        Ok(result.into_rows())
    }

    async fn fetch(
        &self,
        filter: &JsonValue,
        columns: &Selection,
        limit: Option<u64>,
        tx: Option<&mut Transaction>,
    ) -> DbResult<Vec<Row>> {
        let filter = self.object(filter, "filter")?;
        self.check_columns(filter.keys())?;
        self.check_selection(Some(columns))?;

        let result = self
            .run(tx, |dialect, types| {
                builder::select(dialect, types, &self.name, &filter, columns, limit)
            })
            .await?;
        Ok(result.into_rows())
    }

    /// Build the statement for the target connection's dialect and execute it.
    async fn run<B>(&self, tx: Option<&mut Transaction>, build: B) -> DbResult<StatementResult>
    where
        B: FnOnce(DatabaseType, Option<&ColumnTypes>) -> DbResult<Statement>,
    {
        match tx {
            Some(tx) => {
                let dialect = tx.db_type();
                let types = self.column_types(dialect, Some(&mut *tx)).await?;
                let stmt = build(dialect, types.as_deref())?;
                tx.query(&stmt.sql, &stmt.params).await
            }
            None => {
                let dialect = self.db.db_type().await?;
                let types = self.column_types(dialect, None).await?;
                let stmt = build(dialect, types.as_deref())?;
                self.db.query(&stmt.sql, &stmt.params).await
            }
        }
    }

    /// Column types of the table on PostgreSQL, read once and cached.
    ///
    /// Returns `None` on SQLite, and when the table does not exist yet; the
    /// statement itself then reports the missing table.
    async fn column_types(
        &self,
        dialect: DatabaseType,
        tx: Option<&mut Transaction>,
    ) -> DbResult<Option<Arc<ColumnTypes>>> {
        if dialect != DatabaseType::PostgreSQL {
            return Ok(None);
        }
        if let Some(types) = self.column_types.get() {
            return Ok(Some(types.clone()));
        }

        let stmt = builder::column_types(&self.name)?;
        let result = match tx {
            Some(tx) => tx.query(&stmt.sql, &stmt.params).await?,
            None => self.db.query(&stmt.sql, &stmt.params).await?,
        };
        let types: ColumnTypes = result
            .rows
            .iter()
            .filter_map(|row| {
                let name = row.get("name")?.as_str()?;
                let data_type = row.get("data_type")?.as_str()?;
                Some((name.to_string(), data_type.to_string()))
            })
            .collect();
        if types.is_empty() {
            return Ok(None);
        }

        debug!(table = %self.name, columns = types.len(), "Loaded column types");
        let types = Arc::new(types);
        // A concurrent lookup may have set it first
        let _ = self.column_types.set(types.clone());
        Ok(Some(types))
    }

    /// Accept a JSON object, treating `null` as empty.
    fn object<'a>(
        &self,
        value: &'a JsonValue,
        what: &str,
    ) -> DbResult<Cow<'a, Map<String, JsonValue>>> {
        match value {
            JsonValue::Object(map) => Ok(Cow::Borrowed(map)),
            JsonValue::Null => Ok(Cow::Owned(Map::new())),
            other => Err(DbError::invalid_input(format!(
                "The {} for {} must be a JSON object, got {}",
                what,
                self.name,
                json_type_name(other)
            ))),
        }
    }

    fn check_columns<'a, I>(&self, names: I) -> DbResult<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let Some(known) = &self.columns else {
            return Ok(());
        };
        for name in names {
            if !known.contains(name) {
                return Err(DbError::invalid_input(format!(
                    "Unknown column '{}' for table {}",
                    name, self.name
                )));
            }
        }
        Ok(())
    }

    fn check_selection(&self, selection: Option<&Selection>) -> DbResult<()> {
        match selection.and_then(Selection::names) {
            Some(names) => self.check_columns(names),
            None => Ok(()),
        }
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectOptions;
    use serde_json::json;

    async fn memory_db() -> Database {
        let db = Database::connect_with(
            ConnectOptions::parse("sqlite::memory:?max_connections=1").unwrap(),
        )
        .await
        .unwrap();
        db.query(
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, first_name TEXT, last_name TEXT)",
            &[],
        )
        .await
        .unwrap();
        db
    }

    #[test]
    fn test_model_names() {
        let users = Model::in_schema(Database::new(), "tropos", "users");
        assert_eq!(users.table(), "users");
        assert_eq!(users.schema(), Some("tropos"));
        assert_eq!(users.name().to_string(), "tropos.users");
        assert_eq!(Model::new(Database::new(), "users").schema(), None);
    }

    #[tokio::test]
    async fn test_payload_must_be_object() {
        let users = memory_db().await.model("users");
        let err = users.insert(&json!([1, 2]), None, None).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        assert!(err.to_string().contains("array"));
    }

    #[tokio::test]
    async fn test_unknown_column_rejected_by_allowlist() {
        let users = memory_db()
            .await
            .model("users")
            .with_columns(["id", "first_name", "last_name"]);

        let err = users
            .insert(&json!({"first_name": "alois", "nickname": "al"}), None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nickname"));

        let err = users
            .select(&json!({}), Selection::from("id, email"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("email"));

        let rows = users
            .insert(&json!({"first_name": "alois"}), Some(Selection::from("id")), None)
            .await
            .unwrap();
        assert_eq!(rows[0].get("id"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_insert_without_returning_returns_no_rows() {
        let users = memory_db().await.model("users");
        let rows = users
            .insert(&json!({"first_name": "alois"}), None, None)
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(users.select(&JsonValue::Null, Selection::All, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_null_filter_matches_missing_values() {
        let users = memory_db().await.model("users");
        users
            .insert(&json!({"first_name": "alois", "last_name": null}), None, None)
            .await
            .unwrap();
        users
            .insert(&json!({"first_name": "sam", "last_name": "barreras"}), None, None)
            .await
            .unwrap();

        let row = users
            .select_one(&json!({"last_name": null}), Selection::from("first_name"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("first_name"), Some(&json!("alois")));
        assert_eq!(row.len(), 1);
    }
}
