//! Statement-related data models.
//!
//! This module defines positional parameters, statements and their results.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Default statement timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// A single result row: column name to value.
pub type Row = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Arrays and objects, bound as JSON
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
        }
    }
}

impl From<JsonValue> for QueryParam {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(v) => Self::Bool(v),
            JsonValue::Number(n) => match n.as_i64() {
                Some(v) => Self::Int(v),
                // u64 beyond i64::MAX falls through to float, as does any fractional number
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(v) => Self::String(v),
            other => Self::Json(other),
        }
    }
}

impl From<&JsonValue> for QueryParam {
    fn from(value: &JsonValue) -> Self {
        Self::from(value.clone())
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// A statement ready for execution: SQL text plus positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

impl Statement {
    /// Create a statement without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Add a parameter.
    pub fn with_param(mut self, param: impl Into<QueryParam>) -> Self {
        self.params.push(param.into());
        self
    }
}

/// Result of executing one statement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatementResult {
    /// Rows returned by the statement (SELECT or RETURNING)
    pub rows: Vec<Row>,
    /// Rows returned, or rows affected when nothing was returned
    pub row_count: u64,
    pub execution_time_ms: u64,
}

impl StatementResult {
    /// First returned row, if any.
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Consume the result, keeping only the rows.
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}
