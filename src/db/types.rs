//! PostgreSQL value mapping.
//!
//! Rows reach us in two wire formats. Statements without parameters use the
//! simple query protocol, where every value arrives as text; parameterized
//! statements use the extended protocol and binary values. Both are mapped
//! to the same JSON shape:
//!
//! 1. `TypeCategory` classifies the column type
//! 2. the value is decoded from whichever format it arrived in

use crate::models::ColumnMetadata;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};

pub use crate::models::JsonRow;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Binary,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Text,
    Unknown,
}

/// Classify a PostgreSQL type name (as reported by the driver).
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_ascii_lowercase();
    if lower.ends_with("[]") {
        return TypeCategory::Unknown;
    }
    match lower.as_str() {
        "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" | "smallserial"
        | "serial" | "bigserial" => TypeCategory::Integer,
        "float4" | "float8" | "real" | "double precision" => TypeCategory::Float,
        "numeric" | "decimal" => TypeCategory::Decimal,
        "bool" | "boolean" => TypeCategory::Boolean,
        "bytea" => TypeCategory::Binary,
        "json" | "jsonb" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "timestamp" => TypeCategory::Timestamp,
        "timestamptz" => TypeCategory::TimestampTz,
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        "text" | "varchar" | "bpchar" | "char" | "name" | "citext" | "unknown" => {
            TypeCategory::Text
        }
        _ => TypeCategory::Unknown,
    }
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// NUMERIC value kept as its exact decimal string.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        categorize_type(ty.name()) == TypeCategory::Decimal
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => numeric_binary_to_string(value.as_bytes()?)
                .map(RawDecimal)
                .ok_or_else(|| "malformed binary NUMERIC".into()),
        }
    }
}

/// Render the binary NUMERIC wire format: a header of digit count, weight,
/// sign and display scale followed by base-10000 digits.
fn numeric_binary_to_string(bytes: &[u8]) -> Option<String> {
    let word = |at: usize| -> Option<u16> {
        Some(u16::from_be_bytes([*bytes.get(at)?, *bytes.get(at + 1)?]))
    };
    let ndigits = word(0)? as usize;
    let weight = word(2)? as i16 as i32;
    let sign = word(4)?;
    let dscale = word(6)? as usize;

    let negative = match sign {
        0x0000 => false,
        0x4000 => true,
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => return None,
    };
    let digits: Vec<u16> = (0..ndigits)
        .map(|i| word(8 + i * 2))
        .collect::<Option<_>>()?;
    let digit_at = |i: i32| -> u16 {
        if i < 0 {
            0
        } else {
            digits.get(i as usize).copied().unwrap_or(0)
        }
    };

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                out.push_str(&digit_at(i).to_string());
            } else {
                out.push_str(&format!("{:04}", digit_at(i)));
            }
        }
    }
    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit_at(i)));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Some(out)
}

// =============================================================================
// Binary Encoding
// =============================================================================

/// Decode binary data to JSON value.
///
/// If `decode_binary` is true, attempts to decode as UTF-8 text first.
/// Falls back to base64 encoding if not valid UTF-8 or if `decode_binary` is false.
pub fn decode_binary_value(bytes: &[u8], decode_binary: bool) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    if decode_binary {
        if let Ok(s) = std::str::from_utf8(bytes) {
            return JsonValue::String(s.to_string());
        }
    }
    JsonValue::String(STANDARD.encode(bytes))
}

// =============================================================================
// Row to JSON Trait
// =============================================================================

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
    fn to_json_map_with_options(&self, decode_binary: bool) -> JsonRow;
    fn get_column_metadata(&self) -> Vec<ColumnMetadata>;
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> JsonRow {
        self.to_json_map_with_options(false)
    }

    fn to_json_map_with_options(&self, decode_binary: bool) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let value = decode_column(self, idx, type_name, decode_binary);
                (col.name().to_string(), value)
            })
            .collect()
    }

    fn get_column_metadata(&self) -> Vec<ColumnMetadata> {
        self.columns()
            .iter()
            .map(|col| ColumnMetadata::new(col.name(), col.type_info().name()))
            .collect()
    }
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str, decode_binary: bool) -> JsonValue {
    let category = categorize_type(type_name);
    let raw = match row.try_get_raw(idx) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(column = idx, error = %e, "Failed to read column");
            return JsonValue::Null;
        }
    };
    if raw.is_null() {
        return JsonValue::Null;
    }
    // bytea decodes from both formats
    if category == TypeCategory::Binary {
        return row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| decode_binary_value(&v, decode_binary))
            .unwrap_or(JsonValue::Null);
    }
    match raw.format() {
        PgValueFormat::Text => match raw.as_str() {
            Ok(text) => text_value(text, category),
            Err(e) => {
                tracing::error!(column = idx, error = %e, "Column is not valid UTF-8");
                JsonValue::Null
            }
        },
        PgValueFormat::Binary => binary::decode_column(row, idx, type_name, category),
    }
}

/// Map a text-format value. Anything without a natural JSON form keeps
/// PostgreSQL's own rendering.
fn text_value(text: &str, category: TypeCategory) -> JsonValue {
    match category {
        TypeCategory::Integer => text
            .parse::<i64>()
            .map(|v| JsonValue::Number(v.into()))
            .unwrap_or_else(|_| JsonValue::String(text.to_string())),
        TypeCategory::Float => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(text.to_string())),
        TypeCategory::Boolean => match text {
            "t" | "true" => JsonValue::Bool(true),
            "f" | "false" => JsonValue::Bool(false),
            other => JsonValue::String(other.to_string()),
        },
        TypeCategory::Json => serde_json::from_str(text)
            .unwrap_or_else(|_| JsonValue::String(text.to_string())),
        _ => JsonValue::String(text.to_string()),
    }
}

// =============================================================================
// Binary-format Decoders
// =============================================================================

mod binary {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Uuid => decode_uuid(row, idx),
            TypeCategory::Timestamp => decode_display::<NaiveDateTime>(row, idx),
            TypeCategory::TimestampTz => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::String(v.to_rfc3339()))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Date => decode_display::<NaiveDate>(row, idx),
            TypeCategory::Time => decode_display::<NaiveTime>(row, idx),
            _ => decode_text(row, idx, type_name),
        }
    }

    fn decode_decimal(row: &PgRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v.0),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!("Failed to decode NUMERIC: {:?}", e);
                JsonValue::Null
            }
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        JsonValue::Null
    }

    fn decode_boolean(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_float(row: &PgRow, idx: usize) -> JsonValue {
        let value = row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .or_else(|| {
                row.try_get::<Option<f32>, _>(idx)
                    .ok()
                    .flatten()
                    .map(f64::from)
            });
        match value {
            Some(v) => serde_json::Number::from_f64(v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string())),
            None => JsonValue::Null,
        }
    }

    fn decode_json(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<serde_json::Value>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null)
    }

    fn decode_uuid(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get_raw(idx)
            .ok()
            .and_then(|raw| raw.as_bytes().ok().map(<[u8]>::to_vec))
            .and_then(|bytes| uuid::Uuid::from_slice(&bytes).ok())
            .map(|u| JsonValue::String(u.hyphenated().to_string()))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_display<T>(row: &PgRow, idx: usize) -> JsonValue
    where
        T: std::fmt::Display + for<'r> Decode<'r, sqlx::Postgres> + Type<sqlx::Postgres>,
    {
        row.try_get::<Option<T>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::String(v.to_string()))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_text(row: &PgRow, idx: usize, type_name: &str) -> JsonValue {
        match row.try_get::<Option<String>, _>(idx) {
            Ok(v) => v.map(JsonValue::String).unwrap_or(JsonValue::Null),
            Err(_) => {
                tracing::debug!(column = idx, type_name, "No binary decoder for column type");
                JsonValue::String(format!("<{type_name}>"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_exact_names() {
        assert_eq!(categorize_type("INT4"), TypeCategory::Integer);
        assert_eq!(categorize_type("FLOAT8"), TypeCategory::Float);
        assert_eq!(categorize_type("NUMERIC"), TypeCategory::Decimal);
        assert_eq!(categorize_type("JSONB"), TypeCategory::Json);
        assert_eq!(categorize_type("TIMESTAMPTZ"), TypeCategory::TimestampTz);
        assert_eq!(categorize_type("VARCHAR"), TypeCategory::Text);
        // substrings of integer names are not integers
        assert_eq!(categorize_type("INTERVAL"), TypeCategory::Unknown);
        assert_eq!(categorize_type("POINT"), TypeCategory::Unknown);
        assert_eq!(categorize_type("INT4[]"), TypeCategory::Unknown);
    }

    #[test]
    fn test_text_values() {
        assert_eq!(text_value("42", TypeCategory::Integer), JsonValue::from(42));
        assert_eq!(text_value("1.5", TypeCategory::Float), JsonValue::from(1.5));
        assert_eq!(text_value("NaN", TypeCategory::Float), JsonValue::from("NaN"));
        assert_eq!(text_value("t", TypeCategory::Boolean), JsonValue::Bool(true));
        assert_eq!(
            text_value("{\"a\":1}", TypeCategory::Json),
            serde_json::json!({"a": 1})
        );
        assert_eq!(
            text_value("12345678901234567890.5", TypeCategory::Decimal),
            JsonValue::from("12345678901234567890.5")
        );
        assert_eq!(
            text_value("2024-01-02 03:04:05+00", TypeCategory::TimestampTz),
            JsonValue::from("2024-01-02 03:04:05+00")
        );
    }

    fn numeric(ndigits: u16, weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&ndigits.to_be_bytes());
        out.extend_from_slice(&weight.to_be_bytes());
        out.extend_from_slice(&sign.to_be_bytes());
        out.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            out.extend_from_slice(&d.to_be_bytes());
        }
        out
    }

    #[test]
    fn test_numeric_binary() {
        // 12345.678
        let bytes = numeric(3, 1, 0, 3, &[1, 2345, 6780]);
        assert_eq!(numeric_binary_to_string(&bytes).as_deref(), Some("12345.678"));
        // -0.05
        let bytes = numeric(1, -1, 0x4000, 2, &[500]);
        assert_eq!(numeric_binary_to_string(&bytes).as_deref(), Some("-0.05"));
        // 0.00001
        let bytes = numeric(1, -2, 0, 5, &[1000]);
        assert_eq!(numeric_binary_to_string(&bytes).as_deref(), Some("0.00001"));
        // 10000
        let bytes = numeric(1, 1, 0, 0, &[1]);
        assert_eq!(numeric_binary_to_string(&bytes).as_deref(), Some("10000"));
        // zero
        let bytes = numeric(0, 0, 0, 0, &[]);
        assert_eq!(numeric_binary_to_string(&bytes).as_deref(), Some("0"));
        let bytes = numeric(0, 0, 0xC000, 0, &[]);
        assert_eq!(numeric_binary_to_string(&bytes).as_deref(), Some("NaN"));
        assert_eq!(numeric_binary_to_string(&[0, 1]), None);
    }

    #[test]
    fn test_decode_binary_value() {
        assert_eq!(decode_binary_value(b"hello", true), JsonValue::from("hello"));
        assert_eq!(decode_binary_value(b"hello", false), JsonValue::from("aGVsbG8="));
        assert_eq!(decode_binary_value(&[0xff, 0xfe], true), JsonValue::from("//4="));
    }
}
