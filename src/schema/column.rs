//! Column Declarations
//!
//! Column kinds drive three things: normalisation of entity values before
//! comparison, the zero value used for insert binds, and the JSON encoding of
//! cached rows.

use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::value::{parse_time, Value};

/// Default significant digits kept by narrow (32-bit) float columns
pub const NARROW_FLOAT_DIGITS: u32 = 8;

/// Default significant digits kept by wide (64-bit) float columns
pub const WIDE_FLOAT_DIGITS: u32 = 16;

/// Rounding applied to a float column before values are compared.
///
/// Columns built with [`ColumnKind::float`] keep significant digits; a
/// declared scale such as `decimal(10,2)` maps to [`Precision::Decimals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// Digits after the decimal point
    Decimals(u32),
    /// Significant digits
    Significant(u32),
}

impl Precision {
    pub fn round(self, value: f64) -> f64 {
        match self {
            Precision::Decimals(decimals) => round_float(value, decimals),
            Precision::Significant(digits) => round_significant(value, digits),
        }
    }

    fn tag(self) -> String {
        match self {
            Precision::Decimals(decimals) => format!("d{}", decimals),
            Precision::Significant(digits) => format!("s{}", digits),
        }
    }
}

/// Behaviour of a reference when its target row is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnDelete {
    /// Refuse to delete a referenced row
    #[default]
    Restrict,
    /// Delete referencing rows together with the target
    Cascade,
}

/// Persisted kind of a column
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnKind {
    Int,
    UInt,
    Float {
        precision: Precision,
        wide: bool,
    },
    Bool,
    Str,
    Time,
    Json,
    /// Single reference holding the target ID
    Reference {
        target: String,
        on_delete: OnDelete,
    },
    /// Ordered list of target IDs stored as a JSON array
    ReferenceList {
        target: String,
    },
    /// Soft-delete marker: 0 when live, the row's own ID when deleted
    SoftDelete,
}

impl ColumnKind {
    /// Float column with the default precision for its width
    pub fn float(wide: bool) -> Self {
        let digits = if wide {
            WIDE_FLOAT_DIGITS
        } else {
            NARROW_FLOAT_DIGITS
        };
        ColumnKind::Float {
            precision: Precision::Significant(digits),
            wide,
        }
    }

    /// Short tag used in the shape hash
    pub(crate) fn tag(&self) -> String {
        match self {
            ColumnKind::Int => "int".into(),
            ColumnKind::UInt => "uint".into(),
            ColumnKind::Float { precision, wide } => format!("float{}:{}", precision.tag(), wide),
            ColumnKind::Bool => "bool".into(),
            ColumnKind::Str => "str".into(),
            ColumnKind::Time => "time".into(),
            ColumnKind::Json => "json".into(),
            ColumnKind::Reference { target, .. } => format!("ref:{}", target),
            ColumnKind::ReferenceList { target } => format!("refs:{}", target),
            ColumnKind::SoftDelete => "softdelete".into(),
        }
    }

    /// Target entity of a reference column
    pub fn reference_target(&self) -> Option<&str> {
        match self {
            ColumnKind::Reference { target, .. } | ColumnKind::ReferenceList { target } => {
                Some(target)
            }
            _ => None,
        }
    }
}

/// Declared column
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
}

impl Column {
    /// Create a non-nullable column
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        let nullable = matches!(
            kind,
            ColumnKind::Reference { .. } | ColumnKind::ReferenceList { .. } | ColumnKind::Json
        );
        Self {
            name: name.into(),
            kind,
            nullable,
        }
    }

    /// Allow NULL in this column
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Zero value of the column for a fresh entity
    pub fn zero(&self) -> Value {
        if self.nullable {
            return Value::Null;
        }
        match self.kind {
            ColumnKind::Int => Value::Int(0),
            ColumnKind::UInt | ColumnKind::SoftDelete => Value::UInt(0),
            ColumnKind::Float { .. } => Value::Float(0.0),
            ColumnKind::Bool => Value::Bool(false),
            ColumnKind::Str => Value::Str(String::new()),
            _ => Value::Null,
        }
    }

    /// Bring an entity value into the canonical form for this column.
    ///
    /// `id` is the owning row's ID, used by soft-delete markers.
    pub fn normalize(&self, value: Value, id: u64) -> Result<Value> {
        let normalized = match (&self.kind, value) {
            (_, Value::Null) => Value::Null,
            (ColumnKind::Int, Value::UInt(v)) => Value::Int(
                i64::try_from(v).map_err(|_| self.type_error("int", "uint out of range"))?,
            ),
            (ColumnKind::Int, v @ Value::Int(_)) => v,
            (ColumnKind::UInt, Value::Int(v)) if v >= 0 => Value::UInt(v as u64),
            (ColumnKind::UInt, v @ Value::UInt(_)) => v,
            (ColumnKind::Float { precision, .. }, v) => match v {
                Value::Float(f) => Value::Float(precision.round(f)),
                Value::Int(i) => Value::Float(i as f64),
                Value::UInt(u) => Value::Float(u as f64),
                other => return Err(self.type_error("float", other.type_name())),
            },
            (ColumnKind::Bool, v @ Value::Bool(_)) => v,
            (ColumnKind::Bool, Value::Int(v)) => Value::Bool(v != 0),
            (ColumnKind::Bool, Value::UInt(v)) => Value::Bool(v != 0),
            (ColumnKind::Str, v @ Value::Str(_)) => v,
            (ColumnKind::Time, v @ Value::Time(_)) => v,
            (ColumnKind::Time, Value::Str(s)) => Value::Time(
                parse_time(&s).ok_or_else(|| self.type_error("time", "unparsable string"))?,
            ),
            (ColumnKind::Json, v) => match v {
                Value::Json(Json::Null) => Value::Null,
                Value::Json(j) => Value::Json(j),
                Value::Str(s) => Value::Json(serde_json::from_str(&s)?),
                other => return Err(self.type_error("json", other.type_name())),
            },
            (ColumnKind::Reference { .. }, v) => match v.as_id() {
                Some(0) => Value::Null,
                Some(id) => Value::UInt(id),
                None => return Err(self.type_error("reference id", v.type_name())),
            },
            (ColumnKind::ReferenceList { .. }, v) => match v {
                Value::Json(Json::Array(items)) if items.is_empty() => Value::Null,
                Value::Json(Json::Array(items)) => {
                    let ids = items
                        .iter()
                        .filter_map(Json::as_u64)
                        .filter(|id| *id != 0)
                        .map(Json::from)
                        .collect::<Vec<_>>();
                    if ids.is_empty() {
                        Value::Null
                    } else {
                        Value::Json(Json::Array(ids))
                    }
                }
                Value::Json(Json::Null) => Value::Null,
                other => return Err(self.type_error("reference list", other.type_name())),
            },
            (ColumnKind::SoftDelete, v) => match v {
                Value::Bool(true) => Value::UInt(id),
                Value::Bool(false) => Value::UInt(0),
                other => match other.as_id() {
                    Some(marker) => Value::UInt(marker),
                    None => return Err(self.type_error("soft delete marker", other.type_name())),
                },
            },
            (_, other) => {
                let expected = self.kind.tag();
                return Err(self.type_error(&expected, other.type_name()));
            }
        };
        if normalized.is_null() && !self.nullable {
            return Ok(self.zero());
        }
        Ok(normalized)
    }

    /// Encode a normalised value for the cached row array
    pub fn encode(&self, value: &Value) -> Json {
        match value {
            Value::Null => Json::Null,
            Value::Int(v) => Json::from(*v),
            Value::UInt(v) => Json::from(*v),
            Value::Float(v) => Json::from(*v),
            Value::Bool(v) => Json::from(*v),
            Value::Str(v) => Json::from(v.as_str()),
            Value::Time(v) => Json::from(v.to_rfc3339()),
            Value::Json(v) => v.clone(),
        }
    }

    /// Decode a cached JSON element back into a value of this column's kind
    pub fn decode(&self, json: &Json) -> Option<Value> {
        if json.is_null() {
            return Some(if self.nullable { Value::Null } else { self.zero() });
        }
        let value = match &self.kind {
            ColumnKind::Int => Value::Int(json.as_i64()?),
            ColumnKind::UInt
            | ColumnKind::SoftDelete
            | ColumnKind::Reference { .. } => Value::UInt(json.as_u64()?),
            ColumnKind::Float { .. } => Value::Float(json.as_f64()?),
            ColumnKind::Bool => Value::Bool(json.as_bool()?),
            ColumnKind::Str => Value::Str(json.as_str()?.to_string()),
            ColumnKind::Time => Value::Time(parse_time(json.as_str()?)?),
            ColumnKind::Json | ColumnKind::ReferenceList { .. } => Value::Json(json.clone()),
        };
        Some(value)
    }

    fn type_error(&self, expected: &str, got: &str) -> Error {
        Error::ValueType {
            column: self.name.clone(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}

/// Round a float to a fixed number of decimals.
pub fn round_float(value: f64, decimals: u32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    format!("{:.*}", decimals as usize, value)
        .parse()
        .unwrap_or(value)
}

/// Round a float to a number of significant digits.
pub fn round_significant(value: f64, digits: u32) -> f64 {
    if !value.is_finite() || value == 0.0 || digits == 0 {
        return value;
    }
    format!("{:.*e}", digits as usize - 1, value)
        .parse()
        .unwrap_or(value)
}
