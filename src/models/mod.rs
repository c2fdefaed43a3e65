//! Data models for lanston.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::DatabaseType;
pub use query::{DEFAULT_QUERY_TIMEOUT_SECS, QueryParam, Row, Statement, StatementResult};
