//! Statement execution engine.
//!
//! This module runs parameterized statements with support for:
//! - Positional parameters (`$n` on PostgreSQL, `?` on SQLite)
//! - Statement timeouts
//! - Execution on the shared pool or on a leased connection
//!
//! # Architecture
//!
//! The executor uses database-specific implementations organized in submodules:
//! - `postgres`: PostgreSQL-specific execution
//! - `sqlite`: SQLite-specific execution
//!
//! Both submodules are generic over `sqlx::Executor`, so the same code serves
//! `&Pool` and `&mut Connection`.

use crate::db::pool::{DbPool, LeasedConnection};
use crate::db::types::IntoRow;
use crate::error::{DbError, DbResult};
use crate::models::{DEFAULT_QUERY_TIMEOUT_SECS, QueryParam, StatementResult};
use futures_util::TryStreamExt;
use sqlx::Either;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

/// Statement executor that handles database statement execution.
#[derive(Debug, Clone, Copy)]
pub struct QueryExecutor {
    default_timeout: Duration,
}

impl QueryExecutor {
    /// Create a new executor with the default statement timeout.
    pub fn new() -> Self {
        Self {
            default_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
        }
    }

    /// Create a new executor with a custom statement timeout.
    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Statement timeout applied to every execution.
    pub fn timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Execute a statement on whichever pooled connection is free.
    pub async fn execute(
        &self,
        pool: &DbPool,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<StatementResult> {
        let start = Instant::now();
        let (rows_affected, rows) = match pool {
            DbPool::Postgres(p) => {
                let (affected, rows) = postgres::run(p, sql, params, self.default_timeout).await?;
                (affected, rows.iter().map(IntoRow::to_row).collect::<DbResult<_>>()?)
            }
            DbPool::SQLite(p) => {
                let (affected, rows) = sqlite::run(p, sql, params, self.default_timeout).await?;
                (affected, rows.iter().map(IntoRow::to_row).collect::<DbResult<_>>()?)
            }
        };
        Ok(finish(sql, params, rows_affected, rows, start))
    }

    /// Execute a statement on a leased connection.
    pub async fn execute_on(
        &self,
        conn: &mut LeasedConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<StatementResult> {
        let start = Instant::now();
        let (rows_affected, rows) = match conn {
            LeasedConnection::Postgres(c) => {
                let (affected, rows) =
                    postgres::run(&mut **c, sql, params, self.default_timeout).await?;
                (affected, rows.iter().map(IntoRow::to_row).collect::<DbResult<_>>()?)
            }
            LeasedConnection::SQLite(c) => {
                let (affected, rows) =
                    sqlite::run(&mut **c, sql, params, self.default_timeout).await?;
                (affected, rows.iter().map(IntoRow::to_row).collect::<DbResult<_>>()?)
            }
        };
        Ok(finish(sql, params, rows_affected, rows, start))
    }
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Assemble the result and emit per-statement diagnostics.
fn finish(
    sql: &str,
    params: &[QueryParam],
    rows_affected: u64,
    rows: Vec<crate::models::Row>,
    start: Instant,
) -> StatementResult {
    let execution_time_ms = start.elapsed().as_millis() as u64;
    // SELECT reports no affected rows; DML with RETURNING reports both
    let row_count = rows_affected.max(rows.len() as u64);

    debug!(
        target: "lanston::query_stats",
        sql = %sql,
        params = params.len(),
        duration_ms = execution_time_ms,
        rows = row_count,
        "Executed statement"
    );

    StatementResult {
        rows,
        row_count,
        execution_time_ms,
    }
}

fn timeout_error(operation: &str, timeout: Duration) -> DbError {
    DbError::timeout(operation, timeout.as_secs() as u32)
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// The code structure is intentionally parallel to make differences obvious.

mod postgres {
    use super::*;
    use crate::db::params::postgres_query;
    use sqlx::Postgres;
    use sqlx::postgres::PgRow;

    pub async fn run<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
        query_timeout: Duration,
    ) -> DbResult<(u64, Vec<PgRow>)>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        // When params is empty, send raw SQL so BEGIN/COMMIT and multi-statement
        // scripts bypass the prepared statement path
        let mut stream = if params.is_empty() {
            executor.fetch_many(sql)
        } else {
            executor.fetch_many(postgres_query(sql, params))
        };

        let collect = async move {
            let mut rows_affected = 0u64;
            let mut rows = Vec::new();
            while let Some(step) = stream.try_next().await? {
                match step {
                    Either::Left(done) => rows_affected += done.rows_affected(),
                    Either::Right(row) => rows.push(row),
                }
            }
            Ok::<_, sqlx::Error>((rows_affected, rows))
        };

        match timeout(query_timeout, collect).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("statement execution", query_timeout)),
        }
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::sqlite_query;
    use sqlx::Sqlite;
    use sqlx::sqlite::SqliteRow;

    pub async fn run<'e, E>(
        executor: E,
        sql: &'e str,
        params: &'e [QueryParam],
        query_timeout: Duration,
    ) -> DbResult<(u64, Vec<SqliteRow>)>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let mut stream = if params.is_empty() {
            executor.fetch_many(sql)
        } else {
            executor.fetch_many(sqlite_query(sql, params))
        };

        let collect = async move {
            let mut rows_affected = 0u64;
            let mut rows = Vec::new();
            while let Some(step) = stream.try_next().await? {
                match step {
                    Either::Left(done) => rows_affected += done.rows_affected(),
                    Either::Right(row) => rows.push(row),
                }
            }
            Ok::<_, sqlx::Error>((rows_affected, rows))
        };

        match timeout(query_timeout, collect).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("statement execution", query_timeout)),
        }
    }
}
