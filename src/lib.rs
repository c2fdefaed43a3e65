//! Lanston
//!
//! Pooled access to PostgreSQL and SQLite: a shared connection pool, a statement
//! executor, callback-scoped transactions and per-table models built on top of them.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod table;

pub use config::{Config, ConnectOptions, PoolOptions};
pub use db::{Database, Transaction};
pub use error::{DbError, DbResult};
pub use models::{QueryParam, Row, StatementResult};
pub use table::{Model, Selection};
