//! Column Values
//!
//! A tagged column value used for bind maps, row snapshots and statement
//! arguments, so the flush and read paths stay generic across entity types.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Format used for datetime literals in SQL text.
const SQL_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Single column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL / absent reference
    Null,
    /// Signed integer
    Int(i64),
    /// Unsigned integer (IDs, references, soft-delete markers)
    UInt(u64),
    /// Floating point
    Float(f64),
    /// Boolean
    Bool(bool),
    /// Text
    Str(String),
    /// Timestamp
    Time(DateTime<Utc>),
    /// JSON document (also used for reference ID lists)
    Json(serde_json::Value),
}

impl Value {
    /// Check for NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, used in type errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Time(_) => "time",
            Value::Json(_) => "json",
        }
    }

    /// Interpret as an ID. NULL and negative numbers yield `None`.
    pub fn as_id(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    /// Extract a typed value, reporting the column on mismatch.
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T> {
        T::from_value(self).ok_or_else(|| Error::ValueType {
            column: column.to_string(),
            expected: std::any::type_name::<T>().to_string(),
            got: self.type_name().to_string(),
        })
    }

    /// Render as an escaped SQL literal
    pub fn sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(v) => v.to_string(),
            Value::UInt(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            Value::Str(v) => format!("'{}'", escape_sql_string(v)),
            Value::Time(v) => format!("'{}'", v.format(SQL_DATETIME_FORMAT)),
            Value::Json(v) => format!("'{}'", escape_sql_string(&v.to_string())),
        }
    }

    /// Total order used by in-memory sorting. NULL sorts first.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
            (a, b) => match (a.numeric(), b.numeric()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => a.to_string().cmp(&b.to_string()),
            },
        }
    }

    /// Loose equality used when matching filter conditions: numeric
    /// variants compare by value.
    pub fn matches(&self, other: &Value) -> bool {
        match (self.numeric(), other.numeric()) {
            (Some(x), Some(y)) => x == y,
            _ => self == other,
        }
    }

    fn numeric(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{}", v),
            Value::Time(v) => write!(f, "{}", v.format(SQL_DATETIME_FORMAT)),
            Value::Json(v) => write!(f, "{}", v),
        }
    }
}

/// Escape a string for inclusion in a single-quoted SQL literal.
pub fn escape_sql_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 2);
    for c in input.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\x1a' => out.push_str("\\Z"),
            other => out.push(other),
        }
    }
    out
}

/// Parse a datetime in SQL or RFC 3339 form.
pub(crate) fn parse_time(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(input) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(input, SQL_DATETIME_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

// =============================================================================
// Conversions
// =============================================================================

macro_rules! impl_from {
    ($($ty:ty => $variant:ident as $target:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v as $target)
                }
            }
        )*
    };
}

impl_from!(
    i64 => Int as i64,
    i32 => Int as i64,
    i16 => Int as i64,
    i8 => Int as i64,
    u64 => UInt as u64,
    u32 => UInt as u64,
    u16 => UInt as u64,
    u8 => UInt as u64,
    f64 => Float as f64,
    f32 => Float as f64,
);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Typed extraction from a [`Value`]
pub trait FromValue: Sized {
    /// Convert, returning `None` on a type mismatch
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Option<Self> {
        i64::from_value(value).and_then(|v| i32::try_from(v).ok())
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_id()
    }
}

impl FromValue for u32 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_id().and_then(|v| u32::try_from(v).ok())
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Option<Self> {
        f64::from_value(value).map(|v| v as f32)
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::UInt(v) => Some(*v != 0),
            _ => None,
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Time(v) => Some(*v),
            Value::Str(v) => parse_time(v),
            _ => None,
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Json(v) => Some(v.clone()),
            Value::Null => Some(serde_json::Value::Null),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_sql_string() {
        assert_eq!(escape_sql_string("it's"), "it\\'s");
        assert_eq!(escape_sql_string("a\\b"), "a\\\\b");
        assert_eq!(escape_sql_string("line\nbreak\r"), "line\\nbreak\\r");
        assert_eq!(escape_sql_string("nul\0"), "nul\\0");
        assert_eq!(escape_sql_string("ctrl\x1a"), "ctrl\\Z");
        assert_eq!(escape_sql_string("plain"), "plain");
    }

    #[test]
    fn test_sql_literal() {
        assert_eq!(Value::Null.sql_literal(), "NULL");
        assert_eq!(Value::Bool(true).sql_literal(), "1");
        assert_eq!(Value::from("o'k").sql_literal(), "'o\\'k'");
        assert_eq!(Value::UInt(7).sql_literal(), "7");
    }

    #[test]
    fn test_typed_extraction() {
        let v = Value::Int(18);
        assert_eq!(v.get::<i64>("Age").unwrap(), 18);
        assert_eq!(v.get::<u64>("Age").unwrap(), 18);
        assert!(v.get::<String>("Age").is_err());

        let none: Option<String> = Value::Null.get("Name").unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_compare_mixed_numeric() {
        assert_eq!(Value::Int(3).compare(&Value::UInt(3)), Ordering::Equal);
        assert_eq!(Value::Null.compare(&Value::Int(0)), Ordering::Less);
        assert!(Value::Int(10).matches(&Value::UInt(10)));
        assert!(!Value::Int(10).matches(&Value::Str("10".into())));
    }

    #[test]
    fn test_parse_time_formats() {
        let t = parse_time("2024-03-01 10:20:30").unwrap();
        assert_eq!(t.format(SQL_DATETIME_FORMAT).to_string(), "2024-03-01 10:20:30");
        assert!(parse_time("2024-03-01T10:20:30Z").is_some());
        assert!(parse_time("yesterday").is_none());
    }
}
