//! Error types for lanston.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Backend errors keep their native message and SQLSTATE code so callers can react to
//! constraint violations and similar rejections.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("No connection pool found. Call Database::connect before executing any queries.")]
    NotConnected,

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Statement failed: {message}")]
    Statement {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Transaction aborted: {message} (transaction: {transaction_id})")]
    TransactionAborted {
        message: String,
        transaction_id: String,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a statement error with optional SQL state.
    pub fn statement(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Statement {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a transaction-aborted error (commit failed).
    pub fn transaction_aborted(
        message: impl Into<String>,
        transaction_id: impl Into<String>,
    ) -> Self {
        Self::TransactionAborted {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Statement { suggestion, .. } => Some(suggestion),
            Self::NotConnected => Some("Call Database::connect first"),
            _ => None,
        }
    }

    /// SQLSTATE code reported by the backend, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Statement { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let suggestion = match db_err.kind() {
                    sqlx::error::ErrorKind::UniqueViolation => {
                        "A row with the same unique key already exists"
                    }
                    sqlx::error::ErrorKind::ForeignKeyViolation => {
                        "Check that the referenced row exists"
                    }
                    sqlx::error::ErrorKind::NotNullViolation => {
                        "Provide a value for every NOT NULL column"
                    }
                    sqlx::error::ErrorKind::CheckViolation => {
                        "The row violates a CHECK constraint"
                    }
                    _ => "Check the SQL syntax and referenced objects",
                };
                DbError::statement(db_err.message(), code, suggestion)
            }
            sqlx::Error::RowNotFound => DbError::statement(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 0),
            sqlx::Error::PoolClosed => DbError::NotConnected,
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::statement(
                format!("Type not found: {}", type_name),
                None,
                "Check the parameter and column types",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::invalid_input(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
