//! SQL value types for database-agnostic row handling.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

/// SQL value enum for type-safe row handling.
///
/// Every value read from a source row or bound into a target statement
/// passes through this type, so the transform layer never works with raw
/// wire representations.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL.
    Null,

    /// Boolean value (bit).
    Bool(bool),

    /// 16-bit signed integer (smallint).
    I16(i16),

    /// 32-bit signed integer (int).
    I32(i32),

    /// 64-bit signed integer (bigint).
    I64(i64),

    /// 32-bit floating point (real).
    F32(f32),

    /// 64-bit floating point (float).
    F64(f64),

    /// Text/string data.
    Text(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// UUID/GUID value.
    Uuid(Uuid),

    /// Decimal value with fixed precision.
    Decimal(Decimal),

    /// Timestamp without timezone.
    DateTime(NaiveDateTime),

    /// Date without time component.
    Date(NaiveDate),

    /// Time without date component.
    Time(NaiveTime),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Plain-text rendering used for value translation, prefix stripping
    /// and document-type matching. NULL renders as the empty string.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            SqlValue::Null => String::new(),
            SqlValue::Bool(v) => (if *v { "1" } else { "0" }).to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) => v.to_string(),
            SqlValue::F64(v) => v.to_string(),
            SqlValue::Text(v) => v.clone(),
            SqlValue::Bytes(v) => format!("0x{}", hex_lower(v)),
            SqlValue::Uuid(v) => v.to_string(),
            SqlValue::Decimal(v) => v.to_string(),
            SqlValue::DateTime(v) => v.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
            SqlValue::Date(v) => v.format("%Y-%m-%d").to_string(),
            SqlValue::Time(v) => v.format("%H:%M:%S%.3f").to_string(),
        }
    }

    /// Render as a SQL literal for inline expression expansion.
    ///
    /// Strings are quote-escaped, numbers verbatim, booleans 0/1, temporal
    /// values ISO-formatted inside quotes. This is the only place values are
    /// ever turned into SQL text; everything else binds parameters.
    #[must_use]
    pub fn to_literal(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(v) => (if *v { "1" } else { "0" }).to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) => v.to_string(),
            SqlValue::F64(v) => v.to_string(),
            SqlValue::Text(v) => quote_literal(v),
            SqlValue::Bytes(v) => format!("0x{}", hex_lower(v)),
            SqlValue::Uuid(v) => quote_literal(&v.to_string()),
            SqlValue::Decimal(v) => v.to_string(),
            SqlValue::DateTime(v) => quote_literal(&v.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()),
            SqlValue::Date(v) => quote_literal(&v.format("%Y-%m-%d").to_string()),
            SqlValue::Time(v) => quote_literal(&v.format("%H:%M:%S%.3f").to_string()),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

/// Quote a string literal, escaping embedded single quotes by doubling.
fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_literal_string_escapes_quotes() {
        let v = SqlValue::Text("O'Brien".into());
        assert_eq!(v.to_literal(), "'O''Brien'");
    }

    #[test]
    fn test_literal_numbers_verbatim() {
        assert_eq!(SqlValue::I32(42).to_literal(), "42");
        assert_eq!(SqlValue::I64(-7).to_literal(), "-7");
        assert_eq!(SqlValue::F64(1.5).to_literal(), "1.5");
    }

    #[test]
    fn test_literal_bool_as_bit() {
        assert_eq!(SqlValue::Bool(true).to_literal(), "1");
        assert_eq!(SqlValue::Bool(false).to_literal(), "0");
    }

    #[test]
    fn test_literal_null() {
        assert_eq!(SqlValue::Null.to_literal(), "NULL");
        assert!(SqlValue::Null.is_null());
    }

    #[test]
    fn test_literal_date_iso() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(SqlValue::Date(d).to_literal(), "'2024-03-09'");
    }

    #[test]
    fn test_text_rendering_for_matching() {
        assert_eq!(SqlValue::Text("PED-001".into()).to_text(), "PED-001");
        assert_eq!(SqlValue::I32(10).to_text(), "10");
        assert_eq!(SqlValue::Null.to_text(), "");
    }

    #[test]
    fn test_bytes_render_as_hex() {
        assert_eq!(SqlValue::Bytes(vec![0xde, 0xad]).to_literal(), "0xdead");
    }
}
