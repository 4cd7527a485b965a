//! Row decoding into [`Record`]s.
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders handle the actual value extraction
//!
//! Column names are preserved exactly as the driver reports them, in result
//! order. SQL NULL becomes [`Value::Null`].

use crate::models::{DatabaseType, Record, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};
use tracing::warn;

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
    Date,
    Time,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Temporal types first: "interval" and "point" would otherwise look like integers
    if lower.contains("timestamp") || lower.contains("datetime") {
        return TypeCategory::Timestamp;
    }
    if lower == "date" {
        return TypeCategory::Date;
    }
    if lower == "time" || lower == "timetz" {
        return TypeCategory::Time;
    }
    if lower == "interval" || lower == "point" {
        return TypeCategory::Text;
    }

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "name" || lower == "enum" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Raw DECIMAL value as the server's exact text representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

// =============================================================================
// Binary Encoding
// =============================================================================

/// Render binary data as base64 text.
pub fn decode_binary_value(bytes: &[u8]) -> Value {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    Value::Text(STANDARD.encode(bytes))
}

// =============================================================================
// Row to Record Trait
// =============================================================================

/// Convert a driver row into a [`Record`].
pub trait RowToRecord {
    fn to_record(&self) -> Record;
    fn column_names(&self) -> Vec<String>;
}

impl RowToRecord for MySqlRow {
    fn to_record(&self) -> Record {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), DatabaseType::MySQL);
                (col.name().to_string(), mysql::decode_column(self, idx, category))
            })
            .collect()
    }

    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }
}

impl RowToRecord for PgRow {
    fn to_record(&self) -> Record {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::PostgreSQL);
                (
                    col.name().to_string(),
                    postgres::decode_column(self, idx, type_name, category),
                )
            })
            .collect()
    }

    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }
}

impl RowToRecord for SqliteRow {
    fn to_record(&self) -> Record {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), DatabaseType::SQLite);
                (col.name().to_string(), sqlite::decode_column(self, idx, category))
            })
            .collect()
    }

    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> Value {
        if row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(false) {
            return Value::Null;
        }
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_binary_col(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Timestamp => decode_timestamp(row, idx),
            TypeCategory::Date => decode_date(row, idx),
            TypeCategory::Time => decode_time(row, idx),
            _ => decode_text(row, idx),
        }
    }

    fn decode_decimal(row: &MySqlRow, idx: usize) -> Value {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => Value::Text(v.0),
            Ok(None) => Value::Null,
            Err(e) => {
                warn!(column = idx, error = %e, "Failed to decode DECIMAL");
                Value::Null
            }
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> Value {
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return Value::Int(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return Value::Int(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return Value::Int(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
            return Value::Int(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u32>, _>(idx) {
            return Value::Int(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
            // Values past i64::MAX keep their exact text
            return i64::try_from(v)
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Text(v.to_string()));
        }
        Value::Null
    }

    fn decode_boolean(row: &MySqlRow, idx: usize) -> Value {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null)
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> Value {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return Value::Real(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return Value::Real(v as f64);
        }
        Value::Null
    }

    fn decode_binary_col(row: &MySqlRow, idx: usize) -> Value {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| decode_binary_value(&v))
            .unwrap_or(Value::Null)
    }

    fn decode_json(row: &MySqlRow, idx: usize) -> Value {
        row.try_get::<Option<serde_json::Value>, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Text(v.to_string()))
            .unwrap_or(Value::Null)
    }

    fn decode_timestamp(row: &MySqlRow, idx: usize) -> Value {
        if let Ok(Some(v)) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
            return Value::Timestamp(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
            return Value::Timestamp(v.naive_utc());
        }
        decode_text(row, idx)
    }

    fn decode_date(row: &MySqlRow, idx: usize) -> Value {
        match row.try_get::<Option<NaiveDate>, _>(idx) {
            Ok(Some(v)) => Value::Date(v),
            _ => decode_text(row, idx),
        }
    }

    fn decode_time(row: &MySqlRow, idx: usize) -> Value {
        match row.try_get::<Option<NaiveTime>, _>(idx) {
            Ok(Some(v)) => Value::Text(v.to_string()),
            _ => Value::Null,
        }
    }

    fn decode_text(row: &MySqlRow, idx: usize) -> Value {
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
            return Value::Text(v);
        }
        // VARBINARY-backed text
        if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return match String::from_utf8(v) {
                Ok(s) => Value::Text(s),
                Err(e) => decode_binary_value(e.as_bytes()),
            };
        }
        Value::Null
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, type_name: &str, category: TypeCategory) -> Value {
        if row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(false) {
            return Value::Null;
        }
        match category {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_binary_col(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Uuid => decode_uuid(row, idx),
            TypeCategory::Timestamp => decode_timestamp(row, idx, type_name),
            TypeCategory::Date => decode_date(row, idx),
            TypeCategory::Time => decode_time(row, idx),
            _ => decode_text(row, idx, type_name),
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Value {
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return Value::Int(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return Value::Int(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return Value::Int(v.into());
        }
        Value::Null
    }

    fn decode_boolean(row: &PgRow, idx: usize) -> Value {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null)
    }

    fn decode_float(row: &PgRow, idx: usize) -> Value {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return Value::Real(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return Value::Real(v as f64);
        }
        Value::Null
    }

    fn decode_binary_col(row: &PgRow, idx: usize) -> Value {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| decode_binary_value(&v))
            .unwrap_or(Value::Null)
    }

    fn decode_json(row: &PgRow, idx: usize) -> Value {
        row.try_get::<Option<serde_json::Value>, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Text(v.to_string()))
            .unwrap_or(Value::Null)
    }

    fn decode_uuid(row: &PgRow, idx: usize) -> Value {
        row.try_get::<Option<uuid::Uuid>, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Text(v.to_string()))
            .unwrap_or(Value::Null)
    }

    fn decode_timestamp(row: &PgRow, idx: usize, type_name: &str) -> Value {
        if type_name.eq_ignore_ascii_case("timestamptz") {
            if let Ok(Some(v)) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
                return Value::Timestamp(v.naive_utc());
            }
        }
        row.try_get::<Option<NaiveDateTime>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Timestamp)
            .unwrap_or(Value::Null)
    }

    fn decode_date(row: &PgRow, idx: usize) -> Value {
        row.try_get::<Option<NaiveDate>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Date)
            .unwrap_or(Value::Null)
    }

    fn decode_time(row: &PgRow, idx: usize) -> Value {
        row.try_get::<Option<NaiveTime>, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Text(v.to_string()))
            .unwrap_or(Value::Null)
    }

    fn decode_text(row: &PgRow, idx: usize, type_name: &str) -> Value {
        match row.try_get::<Option<String>, _>(idx) {
            Ok(Some(v)) => Value::Text(v),
            Ok(None) => Value::Null,
            Err(e) => {
                warn!(column = idx, type_name, error = %e, "Column type has no mapping; returning NULL");
                Value::Null
            }
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> Value {
        let runtime_type = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => return Value::Null,
            Ok(raw) => raw.type_info().name().to_ascii_uppercase(),
            Err(_) => return Value::Null,
        };
        match category {
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Timestamp => decode_timestamp(row, idx),
            TypeCategory::Date => decode_date(row, idx),
            // Storage class wins for everything else: SQLite columns are loosely typed
            _ => decode_by_storage(row, idx, &runtime_type),
        }
    }

    fn decode_by_storage(row: &SqliteRow, idx: usize, runtime_type: &str) -> Value {
        match runtime_type {
            "INTEGER" => decode_integer(row, idx),
            "REAL" => decode_float(row, idx),
            "BLOB" => decode_binary_col(row, idx),
            _ => decode_text(row, idx),
        }
    }

    fn decode_integer(row: &SqliteRow, idx: usize) -> Value {
        row.try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null)
    }

    fn decode_boolean(row: &SqliteRow, idx: usize) -> Value {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null)
    }

    fn decode_float(row: &SqliteRow, idx: usize) -> Value {
        row.try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Real)
            .unwrap_or(Value::Null)
    }

    fn decode_binary_col(row: &SqliteRow, idx: usize) -> Value {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| decode_binary_value(&v))
            .unwrap_or(Value::Null)
    }

    fn decode_timestamp(row: &SqliteRow, idx: usize) -> Value {
        match row.try_get::<Option<NaiveDateTime>, _>(idx) {
            Ok(Some(v)) => Value::Timestamp(v),
            _ => decode_text(row, idx),
        }
    }

    fn decode_date(row: &SqliteRow, idx: usize) -> Value {
        match row.try_get::<Option<NaiveDate>, _>(idx) {
            Ok(Some(v)) => Value::Date(v),
            _ => decode_text(row, idx),
        }
    }

    fn decode_text(row: &SqliteRow, idx: usize) -> Value {
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Text)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(
            categorize_type("INT", DatabaseType::MySQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("BIGINT", DatabaseType::PostgreSQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("TINYINT", DatabaseType::MySQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("INTEGER", DatabaseType::SQLite),
            TypeCategory::Integer
        );
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(
            categorize_type("DECIMAL", DatabaseType::MySQL),
            TypeCategory::Decimal
        );
        // SQLite NUMERIC is a float
        assert_eq!(
            categorize_type("numeric", DatabaseType::SQLite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(
            categorize_type("DATETIME", DatabaseType::SQLite),
            TypeCategory::Timestamp
        );
        assert_eq!(
            categorize_type("TIMESTAMPTZ", DatabaseType::PostgreSQL),
            TypeCategory::Timestamp
        );
        assert_eq!(
            categorize_type("DATE", DatabaseType::MySQL),
            TypeCategory::Date
        );
        assert_eq!(
            categorize_type("TIME", DatabaseType::MySQL),
            TypeCategory::Time
        );
        assert_eq!(
            categorize_type("INTERVAL", DatabaseType::PostgreSQL),
            TypeCategory::Text
        );
    }

    #[test]
    fn test_categorize_type_text_and_unknown() {
        assert_eq!(
            categorize_type("VARCHAR", DatabaseType::MySQL),
            TypeCategory::Text
        );
        assert_eq!(
            categorize_type("json", DatabaseType::PostgreSQL),
            TypeCategory::Json
        );
        assert_eq!(
            categorize_type("NULL", DatabaseType::SQLite),
            TypeCategory::Unknown
        );
    }

    #[test]
    fn test_decode_binary_value() {
        assert_eq!(
            decode_binary_value(b"hello world"),
            Value::Text("aGVsbG8gd29ybGQ=".to_string())
        );
        assert_eq!(decode_binary_value(&[]), Value::Text(String::new()));
    }
}
