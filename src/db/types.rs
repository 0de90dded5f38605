//! MySQL type mappings.
//!
//! This module converts sqlx MySQL rows into the crate's [`Row`] / [`Table`]
//! shapes and converts single values into caller-chosen scalar types.
//! Each column is first bucketed by its declared type name, then decoded by
//! the matching reader. Values that fail to decode become JSON `null`.

use crate::models::{Row, Table};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::{Column, Decode, Row as _, Type, TypeInfo};

// =============================================================================
// Column buckets
// =============================================================================

/// Decoder bucket for a MySQL column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Temporal,
    Binary,
    Json,
    Text,
}

/// Classify a MySQL type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal first: "numeric" overlaps with the float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        return TypeCategory::Decimal;
    }

    if lower == "boolean" || lower == "bool" {
        return TypeCategory::Boolean;
    }

    if lower.contains("int") || lower == "year" {
        return TypeCategory::Integer;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "datetime" || lower == "timestamp" || lower == "date" || lower == "time" {
        return TypeCategory::Temporal;
    }

    if lower == "json" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bit" {
        return TypeCategory::Binary;
    }

    TypeCategory::Text
}

// =============================================================================
// DECIMAL
// =============================================================================

/// DECIMAL text exactly as the server sent it.
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
// Row Conversion
// =============================================================================

/// Decode binary data to JSON: UTF-8 text when valid, base64 otherwise.
pub fn decode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    match std::str::from_utf8(bytes) {
        Ok(s) => JsonValue::String(s.to_string()),
        Err(_) => JsonValue::String(STANDARD.encode(bytes)),
    }
}

/// Convert one MySQL row into a name → value map.
pub fn row_to_map(row: &MySqlRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            let type_name = col.type_info().name();
            let value = decode_column(row, idx, categorize_type(type_name));
            (col.name().to_string(), value)
        })
        .collect()
}

/// Column names of a row, in select order.
pub fn column_names(row: &MySqlRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

/// Convert a full result set into a [`Table`].
pub fn rows_to_table(rows: &[MySqlRow]) -> Table {
    let columns = rows.first().map(column_names).unwrap_or_default();
    Table {
        columns,
        rows: rows.iter().map(row_to_map).collect(),
    }
}

fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
    match category {
        TypeCategory::Decimal => decode_decimal(row, idx),
        TypeCategory::Integer => decode_integer(row, idx),
        TypeCategory::Boolean => decode_boolean(row, idx),
        TypeCategory::Float => decode_float(row, idx),
        TypeCategory::Temporal => decode_temporal(row, idx),
        TypeCategory::Binary => decode_binary_col(row, idx),
        TypeCategory::Json => decode_json(row, idx),
        TypeCategory::Text => decode_text(row, idx),
    }
}

fn decode_decimal(row: &MySqlRow, idx: usize) -> JsonValue {
    match row.try_get::<Option<RawDecimal>, _>(idx) {
        Ok(Some(v)) => JsonValue::String(v.0),
        Ok(None) => JsonValue::Null,
        Err(e) => {
            tracing::error!("Failed to decode DECIMAL: {:?}", e);
            JsonValue::Null
        }
    }
}

fn decode_integer(row: &MySqlRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    decode_text(row, idx)
}

fn decode_boolean(row: &MySqlRow, idx: usize) -> JsonValue {
    row.try_get::<Option<bool>, _>(idx)
        .ok()
        .flatten()
        .map(JsonValue::Bool)
        .unwrap_or(JsonValue::Null)
}

fn decode_float(row: &MySqlRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
        return serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(v.to_string()));
    }
    if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
        return serde_json::Number::from_f64(v as f64)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(v.to_string()));
    }
    JsonValue::Null
}

fn decode_temporal(row: &MySqlRow, idx: usize) -> JsonValue {
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

    if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
        return v
            .map(|dt| JsonValue::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .unwrap_or(JsonValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<NaiveDate>, _>(idx) {
        return v
            .map(|d| JsonValue::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(JsonValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<NaiveTime>, _>(idx) {
        return v
            .map(|t| JsonValue::String(t.format("%H:%M:%S%.f").to_string()))
            .unwrap_or(JsonValue::Null);
    }
    decode_text(row, idx)
}

fn decode_binary_col(row: &MySqlRow, idx: usize) -> JsonValue {
    row.try_get::<Option<Vec<u8>>, _>(idx)
        .ok()
        .flatten()
        .map(|v| decode_binary_value(&v))
        .unwrap_or(JsonValue::Null)
}

fn decode_json(row: &MySqlRow, idx: usize) -> JsonValue {
    row.try_get::<Option<JsonValue>, _>(idx)
        .ok()
        .flatten()
        .unwrap_or(JsonValue::Null)
}

fn decode_text(row: &MySqlRow, idx: usize) -> JsonValue {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(JsonValue::String).unwrap_or(JsonValue::Null);
    }
    // Text-protocol results of types sqlx will not map to String
    row.try_get_unchecked::<Option<String>, _>(idx)
        .ok()
        .flatten()
        .map(JsonValue::String)
        .unwrap_or(JsonValue::Null)
}

// =============================================================================
// Scalar Conversion
// =============================================================================

/// Convert a decoded value into `T`.
///
/// Returns `Ok(None)` for SQL NULL. A value that does not deserialize as-is
/// is retried through its textual form, so `"42"` converts to `i64` and
/// `42` converts to `String`.
pub fn convert_scalar<T: DeserializeOwned>(value: &JsonValue) -> Result<Option<T>, String> {
    if value.is_null() {
        return Ok(None);
    }

    let direct_err = match serde_json::from_value::<T>(value.clone()) {
        Ok(v) => return Ok(Some(v)),
        Err(e) => e,
    };

    let fallback = match value {
        JsonValue::String(s) => serde_json::from_str::<T>(s.trim()).ok(),
        other => serde_json::from_value::<T>(JsonValue::String(other.to_string())).ok(),
    };

    fallback
        .map(Some)
        .ok_or_else(|| format!("cannot convert {} into {}: {}", value, std::any::type_name::<T>(), direct_err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_categorize_common_types() {
        assert_eq!(categorize_type("BIGINT UNSIGNED"), TypeCategory::Integer);
        assert_eq!(categorize_type("DECIMAL"), TypeCategory::Decimal);
        assert_eq!(categorize_type("DOUBLE"), TypeCategory::Float);
        assert_eq!(categorize_type("DATETIME"), TypeCategory::Temporal);
        assert_eq!(categorize_type("BOOLEAN"), TypeCategory::Boolean);
        assert_eq!(categorize_type("JSON"), TypeCategory::Json);
        assert_eq!(categorize_type("VARBINARY"), TypeCategory::Binary);
        assert_eq!(categorize_type("VARCHAR"), TypeCategory::Text);
    }

    #[test]
    fn test_decode_binary_value() {
        assert_eq!(decode_binary_value(b"hello"), json!("hello"));
        assert_eq!(decode_binary_value(&[0xff, 0xfe]), json!("//4="));
    }

    #[test]
    fn test_convert_scalar_direct() {
        assert_eq!(convert_scalar::<i64>(&json!(42)).unwrap(), Some(42));
        assert_eq!(
            convert_scalar::<String>(&json!("test")).unwrap(),
            Some("test".to_string())
        );
    }

    #[test]
    fn test_convert_scalar_null() {
        assert_eq!(convert_scalar::<i64>(&JsonValue::Null).unwrap(), None);
    }

    #[test]
    fn test_convert_scalar_through_text() {
        assert_eq!(convert_scalar::<i64>(&json!("42")).unwrap(), Some(42));
        assert_eq!(convert_scalar::<f64>(&json!(" 1.5 ")).unwrap(), Some(1.5));
        assert_eq!(
            convert_scalar::<String>(&json!(7)).unwrap(),
            Some("7".to_string())
        );
    }

    #[test]
    fn test_convert_scalar_datetime() {
        let dt = convert_scalar::<chrono::NaiveDateTime>(&json!("2024-03-01T12:30:00"))
            .unwrap()
            .unwrap();
        assert_eq!(dt.format("%H:%M").to_string(), "12:30");
    }

    #[test]
    fn test_convert_scalar_failure() {
        assert!(convert_scalar::<i64>(&json!("not a number")).is_err());
    }
}
