//! Database-agnostic type mappings.
//!
//! This module turns backend rows into the crate's uniform `Row` representation
//! (column name to JSON value).
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders handle the actual value extraction

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Row};
use serde_json::Value as JsonValue;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as _, Type, TypeInfo, ValueRef};
use std::net::{Ipv4Addr, Ipv6Addr};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    TimeTz,
    Interval,
    /// inet and cidr
    Network,
    Array,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();
    match db {
        DatabaseType::PostgreSQL => categorize_postgres(&lower),
        DatabaseType::SQLite => categorize_sqlite(&lower),
    }
}

/// PostgreSQL reports canonical type names, so they are matched exactly.
fn categorize_postgres(lower: &str) -> TypeCategory {
    if lower.ends_with("[]") {
        return TypeCategory::Array;
    }
    match lower {
        "numeric" | "decimal" => TypeCategory::Decimal,
        "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" => TypeCategory::Integer,
        "float4" | "float8" | "real" | "double precision" => TypeCategory::Float,
        "bool" | "boolean" => TypeCategory::Boolean,
        "json" | "jsonb" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "timestamptz" => TypeCategory::TimestampTz,
        "timestamp" => TypeCategory::Timestamp,
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        "timetz" => TypeCategory::TimeTz,
        "interval" => TypeCategory::Interval,
        "inet" | "cidr" => TypeCategory::Network,
        "bytea" => TypeCategory::Binary,
        "text" | "varchar" | "bpchar" | "char" | "name" | "citext" => TypeCategory::Text,
        _ => TypeCategory::Unknown,
    }
}

/// SQLite declared types follow affinity rules, so they are matched by substring.
fn categorize_sqlite(lower: &str) -> TypeCategory {
    // SQLite's NUMERIC is actually a float
    if lower.contains("decimal") || lower.contains("numeric") {
        return TypeCategory::Float;
    }
    if lower.contains("int") {
        return TypeCategory::Integer;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower.contains("blob") {
        return TypeCategory::Binary;
    }
    if lower.contains("text") || lower.contains("char") || lower.contains("json") {
        return TypeCategory::Text;
    }
    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => numeric_to_string(value.as_bytes()?).map(RawDecimal),
        }
    }
}

/// Render PostgreSQL's binary NUMERIC (base-10000 digit groups) as decimal text.
fn numeric_to_string(bytes: &[u8]) -> Result<String, BoxDynError> {
    let read = |offset: usize| -> Result<u16, BoxDynError> {
        bytes
            .get(offset..offset + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC value".into())
    };

    let ndigits = read(0)? as usize;
    let weight = read(2)? as i16 as i32;
    let sign = read(4)?;
    let dscale = read(6)? as usize;
    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        _ => {}
    }
    let digits = (0..ndigits)
        .map(|i| read(8 + 2 * i))
        .collect::<Result<Vec<_>, _>>()?;
    // Group k is worth digits[k] * 10000^(weight - k)
    let group = |k: i32| -> u16 {
        usize::try_from(k)
            .ok()
            .and_then(|k| digits.get(k).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&group(0).to_string());
        for k in 1..=weight {
            out.push_str(&format!("{:04}", group(k)));
        }
    }
    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut k = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", group(k)));
            k += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}

/// Render PostgreSQL's binary inet/cidr: family, prefix bits, cidr flag, length,
/// then the address bytes.
fn network_to_string(bytes: &[u8]) -> Result<String, BoxDynError> {
    let [family, bits, is_cidr, len, addr @ ..] = bytes else {
        return Err("truncated inet value".into());
    };
    let (address, max_bits) = match (family, *len as usize, addr) {
        (2, 4, &[a, b, c, d]) => (Ipv4Addr::new(a, b, c, d).to_string(), 32),
        (3, 16, addr) if addr.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(addr);
            (Ipv6Addr::from(octets).to_string(), 128)
        }
        _ => return Err(format!("unexpected inet family {}", family).into()),
    };
    // inet omits the prefix of a single host, cidr always shows it
    if *is_cidr != 0 || *bits != max_bits {
        Ok(format!("{}/{}", address, bits))
    } else {
        Ok(address)
    }
}

/// Binary columns are rendered as base64 strings.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

/// ISO 8601 duration as PostgreSQL writes it with `intervalstyle = iso_8601`,
/// e.g. `P1Y2M3DT4H5M6.5S`.
pub fn interval_value(months: i32, days: i32, microseconds: i64) -> JsonValue {
    let mut out = String::from("P");
    for (n, unit) in [(months / 12, 'Y'), (months % 12, 'M'), (days, 'D')] {
        if n != 0 {
            out.push_str(&format!("{}{}", n, unit));
        }
    }
    if microseconds != 0 {
        let sign = if microseconds < 0 { "-" } else { "" };
        let total = microseconds.unsigned_abs();
        let hours = total / 3_600_000_000;
        let minutes = total / 60_000_000 % 60;
        let micros = total % 60_000_000;
        out.push('T');
        if hours != 0 {
            out.push_str(&format!("{}{}H", sign, hours));
        }
        if minutes != 0 {
            out.push_str(&format!("{}{}M", sign, minutes));
        }
        if micros != 0 {
            let seconds = format!("{}.{:06}", micros / 1_000_000, micros % 1_000_000);
            let seconds = seconds.trim_end_matches('0').trim_end_matches('.');
            out.push_str(&format!("{}{}S", sign, seconds));
        }
    }
    if out == "P" {
        out.push_str("T0S");
    }
    JsonValue::String(out)
}

// =============================================================================
// Row Conversion Trait
// =============================================================================

/// Trait for converting backend rows into `Row` maps.
pub trait IntoRow {
    /// Fails with `DbError::Internal` naming the column when a value has no JSON form.
    fn to_row(&self) -> DbResult<Row>;
}

impl IntoRow for PgRow {
    fn to_row(&self) -> DbResult<Row> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::PostgreSQL);
                let value = postgres::decode_column(self, idx, type_name, category)
                    .map_err(|e| decode_error(col.name(), type_name, e))?;
                Ok((col.name().to_string(), value))
            })
            .collect()
    }
}

impl IntoRow for SqliteRow {
    fn to_row(&self) -> DbResult<Row> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::SQLite);
                let value = sqlite::decode_column(self, idx, type_name, category)
                    .map_err(|e| decode_error(col.name(), type_name, e))?;
                Ok((col.name().to_string(), value))
            })
            .collect()
    }
}

fn decode_error(column: &str, type_name: &str, err: sqlx::Error) -> DbError {
    DbError::internal(format!(
        "Cannot decode column '{}' of type {}: {}",
        column, type_name, err
    ))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn nullable<T>(value: Option<T>, to_json: impl FnOnce(T) -> JsonValue) -> JsonValue {
    value.map_or(JsonValue::Null, to_json)
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod postgres {
    use super::*;
    use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
    use sqlx::Postgres;
    use sqlx::postgres::types::{PgInterval, PgTimeTz};
    use sqlx::postgres::{PgHasArrayType, PgTypeKind};

    type Decoded = Result<JsonValue, sqlx::Error>;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> Decoded {
        let typed = match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx, type_name),
            TypeCategory::Boolean => decode::<bool>(row, idx, JsonValue::Bool),
            TypeCategory::Float => decode_float(row, idx, type_name),
            TypeCategory::Binary => decode::<Vec<u8>>(row, idx, |v| encode_binary_value(&v)),
            TypeCategory::Json => decode::<JsonValue>(row, idx, |v| v),
            TypeCategory::Uuid => decode::<uuid::Uuid>(row, idx, |v| JsonValue::String(v.to_string())),
            TypeCategory::TimestampTz => {
                decode::<DateTime<Utc>>(row, idx, |v| JsonValue::String(v.to_rfc3339()))
            }
            TypeCategory::Timestamp => decode::<NaiveDateTime>(row, idx, string),
            TypeCategory::Date => decode::<NaiveDate>(row, idx, string),
            TypeCategory::Time => decode::<NaiveTime>(row, idx, string),
            TypeCategory::TimeTz => decode::<PgTimeTz<NaiveTime, FixedOffset>>(row, idx, |v| {
                JsonValue::String(format!("{}{}", v.time, v.offset))
            }),
            TypeCategory::Interval => decode::<PgInterval>(row, idx, |v| {
                interval_value(v.months, v.days, v.microseconds)
            }),
            TypeCategory::Network => decode_network(row, idx),
            TypeCategory::Array => decode_array(row, idx, type_name),
            TypeCategory::Text => row
                .try_get_unchecked::<Option<String>, _>(idx)
                .map(|v| nullable(v, JsonValue::String)),
            TypeCategory::Unknown => decode_fallback(row, idx),
        };

        // Unprepared statements return every value as text, and a few decoders only
        // understand the binary form; the server's text is the faithful rendering.
        match typed {
            Err(e) => match row.try_get_raw(idx) {
                Ok(raw) if raw.format() == PgValueFormat::Text => raw
                    .as_str()
                    .map(|s| JsonValue::String(s.to_string()))
                    .map_err(|_| e),
                _ => Err(e),
            },
            ok => ok,
        }
    }

    fn string<T: ToString>(v: T) -> JsonValue {
        JsonValue::String(v.to_string())
    }

    fn decode<T>(row: &PgRow, idx: usize, to_json: impl FnOnce(T) -> JsonValue) -> Decoded
    where
        T: for<'r> Decode<'r, Postgres> + Type<Postgres>,
    {
        row.try_get::<Option<T>, _>(idx)
            .map(|v| nullable(v, to_json))
    }

    fn decode_decimal(row: &PgRow, idx: usize) -> Decoded {
        decode::<RawDecimal>(row, idx, |v| JsonValue::String(v.0))
    }

    fn decode_network(row: &PgRow, idx: usize) -> Decoded {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(JsonValue::Null);
        }
        let rendered = match raw.format() {
            PgValueFormat::Text => raw.as_str().map(str::to_string),
            PgValueFormat::Binary => raw.as_bytes().and_then(network_to_string),
        };
        rendered.map(JsonValue::String).map_err(sqlx::Error::Decode)
    }

    fn decode_integer(row: &PgRow, idx: usize, type_name: &str) -> Decoded {
        match type_name {
            "INT2" => decode::<i16>(row, idx, |v| JsonValue::Number(v.into())),
            "INT4" => decode::<i32>(row, idx, |v| JsonValue::Number(v.into())),
            _ => decode::<i64>(row, idx, |v| JsonValue::Number(v.into())),
        }
    }

    fn decode_float(row: &PgRow, idx: usize, type_name: &str) -> Decoded {
        match type_name {
            "FLOAT4" => decode::<f32>(row, idx, |v| float_value(v as f64)),
            _ => decode::<f64>(row, idx, float_value),
        }
    }

    fn array<T>(row: &PgRow, idx: usize, to_json: impl Fn(T) -> JsonValue) -> Decoded
    where
        T: for<'r> Decode<'r, Postgres> + Type<Postgres> + PgHasArrayType,
    {
        row.try_get::<Option<Vec<Option<T>>>, _>(idx)
            .map(|v| nullable(v, |items| elements(items, to_json)))
    }

    fn elements<T>(items: Vec<Option<T>>, to_json: impl Fn(T) -> JsonValue) -> JsonValue {
        JsonValue::Array(
            items
                .into_iter()
                .map(|item| nullable(item, &to_json))
                .collect(),
        )
    }

    /// One-dimensional arrays of the scalar types above become JSON arrays.
    fn decode_array(row: &PgRow, idx: usize, type_name: &str) -> Decoded {
        let element = type_name.trim_end_matches("[]");
        match element {
            "INT2" => array::<i16>(row, idx, |v| JsonValue::Number(v.into())),
            "INT4" => array::<i32>(row, idx, |v| JsonValue::Number(v.into())),
            "INT8" => array::<i64>(row, idx, |v| JsonValue::Number(v.into())),
            "FLOAT4" => array::<f32>(row, idx, |v| float_value(v as f64)),
            "FLOAT8" => array::<f64>(row, idx, float_value),
            "BOOL" => array::<bool>(row, idx, JsonValue::Bool),
            "TEXT" | "VARCHAR" | "CHAR" | "NAME" => array::<String>(row, idx, JsonValue::String),
            "UUID" => array::<uuid::Uuid>(row, idx, string),
            "JSON" | "JSONB" => array::<JsonValue>(row, idx, |v| v),
            "TIMESTAMPTZ" => array::<DateTime<Utc>>(row, idx, |v| JsonValue::String(v.to_rfc3339())),
            "TIMESTAMP" => array::<NaiveDateTime>(row, idx, string),
            "DATE" => array::<NaiveDate>(row, idx, string),
            "TIME" => array::<NaiveTime>(row, idx, string),
            "NUMERIC" => row
                .try_get_unchecked::<Option<Vec<Option<RawDecimal>>>, _>(idx)
                .map(|v| nullable(v, |items| elements(items, |d| JsonValue::String(d.0)))),
            _ if is_enum_array(row, idx) => row
                .try_get_unchecked::<Option<Vec<Option<String>>>, _>(idx)
                .map(|v| nullable(v, |items| elements(items, JsonValue::String))),
            _ => Err(unsupported(type_name)),
        }
    }

    /// Enum labels and types sent as text can be returned as strings; anything else
    /// in binary form has no JSON rendering.
    fn decode_fallback(row: &PgRow, idx: usize) -> Decoded {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(JsonValue::Null);
        }
        let type_info = raw.type_info().into_owned();
        if raw.format() == PgValueFormat::Text || is_enum(&type_info) {
            return raw
                .as_str()
                .map(|s| JsonValue::String(s.to_string()))
                .map_err(sqlx::Error::Decode);
        }
        Err(unsupported(type_info.name()))
    }

    /// Binary values only arrive from prepared statements, whose custom types are
    /// resolved; an unresolved type is reported as "?".
    fn is_enum(ty: &PgTypeInfo) -> bool {
        ty.name() != "?" && matches!(ty.kind(), PgTypeKind::Enum(_))
    }

    fn is_enum_array(row: &PgRow, idx: usize) -> bool {
        match row.try_get_raw(idx) {
            Ok(raw) if raw.format() == PgValueFormat::Binary => {
                let ty = raw.type_info();
                ty.name() != "?"
                    && matches!(ty.kind(), PgTypeKind::Array(element) if is_enum(element))
            }
            _ => false,
        }
    }

    fn unsupported(type_name: &str) -> sqlx::Error {
        sqlx::Error::Decode(format!("no JSON representation for type {}", type_name).into())
    }
}

mod sqlite {
    use super::*;
    use sqlx::Sqlite;

    type Decoded = Result<JsonValue, sqlx::Error>;

    /// Decode by declared type, falling back to the value's storage class when the
    /// stored value does not match its column's affinity.
    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> Decoded {
        let typed = match category {
            TypeCategory::Integer => decode::<i64>(row, idx, |v| JsonValue::Number(v.into())),
            TypeCategory::Boolean => decode::<bool>(row, idx, JsonValue::Bool),
            TypeCategory::Float | TypeCategory::Decimal => decode::<f64>(row, idx, float_value),
            TypeCategory::Binary => decode::<Vec<u8>>(row, idx, |v| encode_binary_value(&v)),
            TypeCategory::Text => decode_text(row, idx, type_name),
            _ => return decode_dynamic(row, idx),
        };
        typed.or_else(|_| decode_dynamic(row, idx))
    }

    fn decode<T>(row: &SqliteRow, idx: usize, to_json: impl FnOnce(T) -> JsonValue) -> Decoded
    where
        T: for<'r> Decode<'r, Sqlite> + Type<Sqlite>,
    {
        row.try_get::<Option<T>, _>(idx)
            .map(|v| nullable(v, to_json))
    }

    /// Expression columns (e.g. `count(*)`) carry no declared type; decode by the
    /// storage class of the value itself.
    fn decode_dynamic(row: &SqliteRow, idx: usize) -> Decoded {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(JsonValue::Null);
        }
        let storage = raw.type_info().name().to_string();
        match storage.as_str() {
            "INTEGER" => row
                .try_get_unchecked::<i64, _>(idx)
                .map(|v| JsonValue::Number(v.into())),
            "REAL" => row.try_get_unchecked::<f64, _>(idx).map(float_value),
            "BLOB" => row
                .try_get_unchecked::<Vec<u8>, _>(idx)
                .map(|v| encode_binary_value(&v)),
            _ => row
                .try_get_unchecked::<String, _>(idx)
                .map(JsonValue::String),
        }
    }

    fn decode_text(row: &SqliteRow, idx: usize, type_name: &str) -> Decoded {
        let value = row.try_get::<Option<String>, _>(idx)?;
        Ok(nullable(value, |v| {
            if type_name.to_lowercase().contains("json") {
                if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
                    return json;
                }
            }
            JsonValue::String(v)
        }))
    }
}
