//! Row decoding for the sqlx-backed sessions.
//!
//! Every result row becomes a [`Row`] map of column name to JSON value. The
//! column's declared type picks a [`ValueKind`], which picks the Rust types to
//! try. Timestamps come out as RFC 3339 strings and binary values as base64,
//! the same encodings `QueryParam` accepts on the way in. Exact numerics stay
//! strings so no precision is lost.

use crate::models::{Dialect, Row};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as _, Type, TypeInfo};

/// How a column's values are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    /// Timestamp with a zone (`TIMESTAMPTZ`, MySQL `TIMESTAMP`)
    TimestampTz,
    /// Timestamp without a zone (`TIMESTAMP`, `DATETIME`)
    Timestamp,
    Date,
    Time,
    Other,
}

/// Classify a declared column type.
pub fn classify(type_name: &str, dialect: Dialect) -> ValueKind {
    let lower = type_name.to_ascii_lowercase();
    match lower.as_str() {
        "bool" | "boolean" => return ValueKind::Boolean,
        "json" | "jsonb" => return ValueKind::Json,
        "uuid" => return ValueKind::Uuid,
        "timestamptz" => return ValueKind::TimestampTz,
        // MySQL stores TIMESTAMP in UTC; DATETIME has no zone
        "timestamp" if dialect == Dialect::MySql => return ValueKind::TimestampTz,
        "timestamp" | "datetime" => return ValueKind::Timestamp,
        "date" => return ValueKind::Date,
        "time" | "timetz" => return ValueKind::Time,
        "real" | "float4" | "float8" => return ValueKind::Float,
        "text" | "name" | "bpchar" => return ValueKind::Text,
        "bytea" => return ValueKind::Binary,
        // SQLite's NUMERIC affinity holds plain numbers
        "numeric" if dialect == Dialect::Sqlite => return ValueKind::Float,
        _ => {}
    }

    if is_integer_type(&lower) {
        ValueKind::Integer
    } else if lower.contains("decimal") || lower.contains("numeric") {
        ValueKind::Decimal
    } else if lower.contains("float") || lower.contains("double") {
        ValueKind::Float
    } else if lower.contains("blob") || lower.contains("binary") {
        ValueKind::Binary
    } else if lower.contains("char") || lower.contains("text") {
        ValueKind::Text
    } else {
        ValueKind::Other
    }
}

/// Integer names, ignoring MySQL's `UNSIGNED` suffix and any display width.
fn is_integer_type(lower: &str) -> bool {
    let base = lower
        .split(|c: char| c == ' ' || c == '(')
        .next()
        .unwrap_or(lower);
    matches!(
        base,
        "int"
            | "int2"
            | "int4"
            | "int8"
            | "integer"
            | "smallint"
            | "bigint"
            | "tinyint"
            | "mediumint"
            | "serial"
            | "serial2"
            | "serial4"
            | "serial8"
            | "smallserial"
            | "bigserial"
    )
}

/// Exact DECIMAL/NUMERIC text as sent by the server.
#[derive(Debug)]
pub struct RawDecimal(pub String);

fn is_decimal_type(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("decimal") || lower.contains("numeric")
}

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        is_decimal_type(ty.name())
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        <&str as Decode<sqlx::MySql>>::decode(value).map(|s| RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        is_decimal_type(ty.name())
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        <&str as Decode<sqlx::Postgres>>::decode(value).map(|s| RawDecimal(s.to_string()))
    }
}

pub fn binary_value(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn naive_value(v: NaiveDateTime) -> JsonValue {
    JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
}

fn string_value(v: impl ToString) -> JsonValue {
    JsonValue::String(v.to_string())
}

fn number_value(v: impl Into<serde_json::Number>) -> JsonValue {
    JsonValue::Number(v.into())
}

/// Value of the first listed type the column decodes as; `Null` if none does.
///
/// A SQL NULL decodes as `None` for every type and also ends as `Null`.
macro_rules! first_decoded {
    ($row:expr, $idx:expr, $($ty:ty => $to_json:expr),+ $(,)?) => {{
        let mut value = None;
        $(
            if value.is_none() {
                if let Ok(decoded) = $row.try_get::<Option<$ty>, _>($idx) {
                    value = Some(decoded.map($to_json).unwrap_or(JsonValue::Null));
                }
            }
        )+
        value.unwrap_or(JsonValue::Null)
    }};
}

/// Converts driver rows into [`Row`] maps.
pub trait RowToJson {
    fn to_row(&self) -> Row;
}

impl RowToJson for MySqlRow {
    fn to_row(&self) -> Row {
        self.columns()
            .iter()
            .map(|col| {
                let kind = classify(col.type_info().name(), Dialect::MySql);
                (col.name().to_string(), decode_mysql(self, col.ordinal(), kind))
            })
            .collect()
    }
}

impl RowToJson for PgRow {
    fn to_row(&self) -> Row {
        self.columns()
            .iter()
            .map(|col| {
                let kind = classify(col.type_info().name(), Dialect::Postgres);
                (col.name().to_string(), decode_postgres(self, col.ordinal(), kind))
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_row(&self) -> Row {
        self.columns()
            .iter()
            .map(|col| {
                let kind = classify(col.type_info().name(), Dialect::Sqlite);
                (col.name().to_string(), decode_sqlite(self, col.ordinal(), kind))
            })
            .collect()
    }
}

fn decode_mysql(row: &MySqlRow, idx: usize, kind: ValueKind) -> JsonValue {
    match kind {
        // Signed before unsigned so negative values are never misread
        ValueKind::Integer => first_decoded!(row, idx,
            i64 => number_value,
            i32 => number_value,
            i16 => number_value,
            i8 => number_value,
            u64 => number_value,
            u32 => number_value,
            u16 => number_value,
            u8 => number_value,
        ),
        ValueKind::Float => first_decoded!(row, idx, f64 => float_value, f32 => |v| float_value(v as f64)),
        ValueKind::Decimal => first_decoded!(row, idx, RawDecimal => |v| JsonValue::String(v.0)),
        ValueKind::Boolean => first_decoded!(row, idx, bool => JsonValue::Bool),
        ValueKind::Binary => first_decoded!(row, idx, Vec<u8> => |v| binary_value(&v)),
        ValueKind::Json => first_decoded!(row, idx, JsonValue => |v| v),
        ValueKind::TimestampTz => {
            first_decoded!(row, idx, DateTime<Utc> => |v| string_value(v.to_rfc3339()))
        }
        ValueKind::Timestamp => first_decoded!(row, idx, NaiveDateTime => naive_value),
        ValueKind::Date => first_decoded!(row, idx, NaiveDate => string_value),
        ValueKind::Time => first_decoded!(row, idx, NaiveTime => string_value),
        ValueKind::Uuid | ValueKind::Text | ValueKind::Other => {
            first_decoded!(row, idx, String => JsonValue::String, Vec<u8> => |v| binary_value(&v))
        }
    }
}

fn decode_postgres(row: &PgRow, idx: usize, kind: ValueKind) -> JsonValue {
    match kind {
        ValueKind::Integer => first_decoded!(row, idx,
            i64 => number_value,
            i32 => number_value,
            i16 => number_value,
        ),
        ValueKind::Float => first_decoded!(row, idx, f64 => float_value, f32 => |v| float_value(v as f64)),
        ValueKind::Decimal => first_decoded!(row, idx, RawDecimal => |v| JsonValue::String(v.0)),
        ValueKind::Boolean => first_decoded!(row, idx, bool => JsonValue::Bool),
        ValueKind::Binary => first_decoded!(row, idx, Vec<u8> => |v| binary_value(&v)),
        ValueKind::Json => first_decoded!(row, idx, JsonValue => |v| v),
        ValueKind::Uuid => first_decoded!(row, idx, uuid::Uuid => string_value),
        ValueKind::TimestampTz => {
            first_decoded!(row, idx, DateTime<Utc> => |v| string_value(v.to_rfc3339()))
        }
        ValueKind::Timestamp => first_decoded!(row, idx, NaiveDateTime => naive_value),
        ValueKind::Date => first_decoded!(row, idx, NaiveDate => string_value),
        ValueKind::Time => first_decoded!(row, idx, NaiveTime => string_value),
        ValueKind::Text | ValueKind::Other => first_decoded!(row, idx, String => JsonValue::String),
    }
}

/// SQLite values are dynamically typed: apart from booleans and blobs the
/// stored value's class decides the JSON type, whatever the declared type.
fn decode_sqlite(row: &SqliteRow, idx: usize, kind: ValueKind) -> JsonValue {
    match kind {
        ValueKind::Boolean => first_decoded!(row, idx, bool => JsonValue::Bool, i64 => number_value),
        ValueKind::Binary => first_decoded!(row, idx, Vec<u8> => |v| binary_value(&v)),
        ValueKind::Json => first_decoded!(row, idx,
            String => |v: String| serde_json::from_str(&v).unwrap_or(JsonValue::String(v)),
        ),
        _ => first_decoded!(row, idx,
            i64 => number_value,
            f64 => float_value,
            String => JsonValue::String,
            Vec<u8> => |v| binary_value(&v),
        ),
    }
}
