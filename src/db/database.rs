//! The database handle.
//!
//! `Database` owns the process-wide pool behind an explicit handle: it is cheap to
//! clone, every clone sees the same pool, and the pool's lifecycle is driven by
//! `connect` and `disconnect`.

use crate::config::ConnectOptions;
use crate::db::executor::QueryExecutor;
use crate::db::pool::{DbPool, PoolStatus};
use crate::db::transaction::{self, Transaction};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam, StatementResult};
use crate::table::Model;
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

struct ConnectedPool {
    pool: DbPool,
    executor: QueryExecutor,
}

#[derive(Default)]
struct Inner {
    state: RwLock<Option<ConnectedPool>>,
}

/// Handle to a connection pool that may or may not be connected yet.
#[derive(Clone, Default)]
pub struct Database {
    inner: Arc<Inner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Create a handle with no pool. Call `connect` before issuing statements.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handle and connect it.
    pub async fn connect_with(options: ConnectOptions) -> DbResult<Self> {
        let db = Self::new();
        db.connect(options).await?;
        Ok(db)
    }

    /// Open the pool.
    pub async fn connect(&self, options: ConnectOptions) -> DbResult<()> {
        // Early check for existing pool
        if self.inner.state.read().await.is_some() {
            return Err(already_connected());
        }

        info!(
            db_type = %options.db_type,
            url = %options.masked_url(),
            "Connecting to database"
        );

        let pool = DbPool::connect(&options).await?;
        let executor = QueryExecutor::with_timeout(options.query_timeout);
        let server_version = get_server_version(&pool, &executor).await;

        // Re-check after async work; a concurrent connect may have won
        let lost_race = {
            let mut state = self.inner.state.write().await;
            if state.is_some() {
                Some(pool)
            } else {
                *state = Some(ConnectedPool { pool, executor });
                None
            }
        };

        if let Some(pool) = lost_race {
            pool.close().await;
            return Err(already_connected());
        }

        info!(
            db_type = %options.db_type,
            server_version = ?server_version,
            "Connected successfully"
        );
        Ok(())
    }

    /// Close every connection. Later operations fail with `DbError::NotConnected`.
    ///
    /// Waits for leased connections to come back. Calling this on a handle that is
    /// not connected does nothing.
    pub async fn disconnect(&self) {
        let taken = self.inner.state.write().await.take();
        if let Some(connected) = taken {
            connected.pool.close().await;
            info!(db_type = %connected.pool.db_type(), "Disconnected");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.read().await.is_some()
    }

    /// Backend of the connected pool.
    pub async fn db_type(&self) -> DbResult<DatabaseType> {
        let state = self.inner.state.read().await;
        state
            .as_ref()
            .map(|c| c.pool.db_type())
            .ok_or(DbError::NotConnected)
    }

    /// Current pool occupancy.
    pub async fn pool_status(&self) -> DbResult<PoolStatus> {
        let state = self.inner.state.read().await;
        state
            .as_ref()
            .map(|c| c.pool.status())
            .ok_or(DbError::NotConnected)
    }

    /// Execute a statement on the shared pool.
    ///
    /// A connection is leased for this one statement and returned when it completes.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<StatementResult> {
        let (pool, executor) = self.snapshot().await?;
        executor.execute(&pool, sql, params).await
    }

    /// Run `f` inside a transaction.
    ///
    /// `f` receives a `Transaction` bound to one leased connection. If it returns
    /// `Ok` the transaction is committed, if it returns `Err` it is rolled back and
    /// the error is returned unchanged. `Transaction::rollback` aborts explicitly; the
    /// call then still returns the callback's `Ok` value. The connection is released
    /// on every path.
    ///
    /// ```no_run
    /// # async fn demo(db: lanston::Database) -> Result<(), lanston::DbError> {
    /// let users = db.model("users");
    /// let user = db
    ///     .transaction(|tx| {
    ///         Box::pin(async move {
    ///             let rows = users
    ///                 .insert(&serde_json::json!({"first_name": "alois"}), Some("*".into()), Some(tx))
    ///                 .await?;
    ///             Ok::<_, lanston::DbError>(rows)
    ///         })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut Transaction) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError> + fmt::Display,
    {
        let (pool, executor) = self.snapshot().await?;
        transaction::run(&pool, executor, f).await
    }

    /// Table model for `table` in the default schema.
    pub fn model(&self, table: impl Into<String>) -> Model {
        Model::new(self.clone(), table)
    }

    /// Table model for `schema.table`.
    pub fn model_in(&self, schema: impl Into<String>, table: impl Into<String>) -> Model {
        Model::in_schema(self.clone(), schema, table)
    }

    /// Clone the pool out of the lock so no statement runs while holding it.
    async fn snapshot(&self) -> DbResult<(DbPool, QueryExecutor)> {
        let state = self.inner.state.read().await;
        let connected = state.as_ref().ok_or(DbError::NotConnected)?;
        Ok((connected.pool.clone(), connected.executor))
    }
}

fn already_connected() -> DbError {
    DbError::connection(
        "Database is already connected",
        "Call disconnect first or use a separate Database handle",
    )
}

/// Get server version string for diagnostics.
async fn get_server_version(pool: &DbPool, executor: &QueryExecutor) -> Option<String> {
    let sql = match pool.db_type() {
        DatabaseType::PostgreSQL => "SELECT version() AS version",
        DatabaseType::SQLite => "SELECT sqlite_version() AS version",
    };
    match executor.execute(pool, sql, &[]).await {
        Ok(result) => result
            .first()
            .and_then(|row| row.get("version"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        Err(e) => {
            debug!(error = %e, "Failed to read server version");
            None
        }
    }
}
