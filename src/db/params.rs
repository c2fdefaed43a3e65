//! Parameter binding utilities for statements.
//!
//! This module binds `QueryParam` values positionally to backend-specific query
//! objects. Both the shared-pool path and the leased-connection path go through it.

use crate::models::QueryParam;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{Postgres, Sqlite};

/// Build a PostgreSQL query with every parameter bound in order.
pub(crate) fn postgres_query<'q>(
    sql: &'q str,
    params: &'q [QueryParam],
) -> Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| match param {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::Int(v) => query.bind(*v),
            QueryParam::Float(v) => query.bind(*v),
            QueryParam::String(v) => query.bind(v.as_str()),
            QueryParam::Json(v) => query.bind(Json(v)),
        })
}

/// Build a SQLite query with every parameter bound in order.
pub(crate) fn sqlite_query<'q>(
    sql: &'q str,
    params: &'q [QueryParam],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| match param {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::Int(v) => query.bind(*v),
            QueryParam::Float(v) => query.bind(*v),
            QueryParam::String(v) => query.bind(v.as_str()),
            // SQLite doesn't have native JSON type, store as string
            QueryParam::Json(v) => query.bind(v.to_string()),
        })
}
