//! Callback-scoped transactions.
//!
//! `run` leases one connection, issues `BEGIN`, hands the caller a `Transaction`
//! bound to that connection, then commits or rolls back depending on how the
//! callback finished. The lease is released on every path.

use crate::db::executor::QueryExecutor;
use crate::db::pool::{DbPool, Lease};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam, StatementResult};
use futures_util::future::BoxFuture;
use std::fmt;
use tracing::{debug, info, warn};

/// Lifecycle of a transaction context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    /// COMMIT or ROLLBACK itself failed
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
            TransactionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Executor bound to the connection leased for one `Database::transaction` call.
///
/// Every statement issued through `query` runs on the same connection, never on the
/// shared pool. The context is only reachable from inside the callback; once the
/// callback returns, the borrow ends and the connection goes back to the pool.
#[derive(Debug)]
pub struct Transaction {
    id: String,
    db_type: DatabaseType,
    lease: Lease,
    executor: QueryExecutor,
    state: TransactionState,
    /// PostgreSQL refuses every statement after a failed one and turns COMMIT into
    /// ROLLBACK without reporting an error.
    poisoned: bool,
}

impl Transaction {
    /// Issue `BEGIN` on a freshly leased connection.
    ///
    /// On failure the lease is released before the error is returned.
    async fn begin(mut lease: Lease, executor: QueryExecutor) -> DbResult<Self> {
        let id = generate_transaction_id();
        let conn = lease.connection()?;
        let db_type = conn.db_type();

        if let Err(e) = executor.execute_on(conn, "BEGIN", &[]).await {
            lease.release();
            return Err(e);
        }
        lease.set_in_transaction(true);

        info!(transaction_id = %id, db_type = %db_type, "Transaction started");

        Ok(Self {
            id,
            db_type,
            lease,
            executor,
            state: TransactionState::Active,
            poisoned: false,
        })
    }

    /// Generated identifier, used in logs and errors.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Backend of the bound connection.
    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Execute a statement on the transaction's connection.
    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<StatementResult> {
        self.ensure_active()?;
        let conn = self.lease.connection()?;
        let result = self.executor.execute_on(conn, sql, params).await;
        if let Err(e) = &result {
            debug!(transaction_id = %self.id, error = %e, "Statement failed inside transaction");
            if self.db_type == DatabaseType::PostgreSQL {
                self.poisoned = true;
            }
        }
        result
    }

    /// Abort the transaction.
    ///
    /// Statements issued afterwards are rejected. Returning `Ok` from the callback
    /// after an explicit rollback makes `Database::transaction` return `Ok` as well.
    pub async fn rollback(&mut self) -> DbResult<()> {
        self.ensure_active()?;
        self.finish_with("ROLLBACK", TransactionState::RolledBack)
            .await?;
        info!(transaction_id = %self.id, "Transaction rolled back");
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        if self.poisoned {
            self.rollback_quietly().await;
            return Err(DbError::transaction_aborted(
                "a statement failed inside the transaction; changes were rolled back",
                self.id.clone(),
            ));
        }

        if let Err(e) = self.finish_with("COMMIT", TransactionState::Committed).await {
            // The connection may still hold an open transaction
            self.state = TransactionState::Active;
            self.rollback_quietly().await;
            self.state = TransactionState::Failed;
            return Err(DbError::transaction_aborted(
                format!("commit failed: {}", e),
                self.id.clone(),
            ));
        }

        info!(transaction_id = %self.id, "Transaction committed");
        Ok(())
    }

    /// Roll back after a failure, logging instead of returning rollback errors.
    async fn rollback_quietly(&mut self) {
        match self
            .finish_with("ROLLBACK", TransactionState::RolledBack)
            .await
        {
            Ok(()) => info!(transaction_id = %self.id, "Transaction rolled back"),
            Err(e) => warn!(
                transaction_id = %self.id,
                error = %e,
                "Rollback failed; connection will be closed"
            ),
        }
    }

    /// Issue a terminating statement and move to `next`, or to `Failed`.
    async fn finish_with(&mut self, sql: &str, next: TransactionState) -> DbResult<()> {
        let conn = self.lease.connection()?;
        match self.executor.execute_on(conn, sql, &[]).await {
            Ok(_) => {
                self.state = next;
                self.lease.set_in_transaction(false);
                Ok(())
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                Err(e)
            }
        }
    }

    fn ensure_active(&self) -> DbResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DbError::transaction(
                format!("Transaction is no longer active ({})", self.state),
                self.id.clone(),
            ))
        }
    }

    /// Give the connection back; detached instead if a transaction is still open.
    fn release(self) {
        debug!(transaction_id = %self.id, state = %self.state, "Releasing transaction connection");
        self.lease.release();
    }
}

/// Run `f` inside a transaction on a connection leased from `pool`.
pub(crate) async fn run<F, T, E>(
    pool: &DbPool,
    executor: QueryExecutor,
    f: F,
) -> Result<T, E>
where
    F: for<'c> FnOnce(&'c mut Transaction) -> BoxFuture<'c, Result<T, E>>,
    E: From<DbError> + fmt::Display,
{
    let lease = pool.lease().await?;
    let mut tx = Transaction::begin(lease, executor).await?;

    match f(&mut tx).await {
        Ok(value) => {
            if tx.is_active() {
                if let Err(e) = tx.commit().await {
                    tx.release();
                    return Err(e.into());
                }
            } else {
                debug!(transaction_id = %tx.id, state = %tx.state, "Callback finished the transaction");
            }
            tx.release();
            Ok(value)
        }
        Err(err) => {
            if tx.is_active() {
                info!(transaction_id = %tx.id, error = %err, "Callback failed; rolling back");
                tx.rollback_quietly().await;
            }
            tx.release();
            Err(err)
        }
    }
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
