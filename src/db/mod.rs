//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection pool management and connection leases
//! - Statement execution
//! - Callback-scoped transactions
//! - Type mappings

pub mod database;
pub mod executor;
pub mod params;
pub mod pool;
pub mod transaction;
pub mod types;

pub use database::Database;
pub use executor::QueryExecutor;
pub use pool::{DbPool, Lease, LeasedConnection, PoolStatus};
pub use transaction::{Transaction, TransactionState};
