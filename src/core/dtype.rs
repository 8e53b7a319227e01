//! Purpose: Element types and scalar values shared by columns, frames and backends.
//! Exports: `DType`, `Value`, `format_time_ns`.
//! Role: Single source of truth for dtype names on the wire and null fill values.
//! Invariants: Integer widths widen into `Int64`; `f32` widens into `Float64`.
//! Invariants: Timestamps are nanoseconds since the Unix epoch, UTC.
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DType {
    Bool,
    Int64,
    Float64,
    String,
    TimestampNs,
}

impl DType {
    pub fn wire_name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int64 => "int64",
            DType::Float64 => "float64",
            DType::String => "string",
            DType::TimestampNs => "timestamp_ns",
        }
    }

    pub fn from_wire(name: &str) -> Result<DType, Error> {
        match name {
            "bool" => Ok(DType::Bool),
            "int64" => Ok(DType::Int64),
            "float64" => Ok(DType::Float64),
            "string" => Ok(DType::String),
            "timestamp_ns" => Ok(DType::TimestampNs),
            other => Err(Error::new(ErrorKind::UnsupportedDType)
                .with_message(format!("unsupported dtype '{other}'"))),
        }
    }

    /// Fill value for a null cell.
    pub fn null_value(self) -> Value {
        match self {
            DType::Bool => Value::Bool(false),
            DType::Int64 => Value::Int(0),
            DType::Float64 => Value::Float(f64::NAN),
            DType::String => Value::String(String::new()),
            DType::TimestampNs => Value::Time(0),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "value")]
pub enum Value {
    #[serde(rename = "bool")]
    Bool(bool),
    #[serde(rename = "int64")]
    Int(i64),
    #[serde(rename = "float64")]
    Float(f64),
    #[serde(rename = "string")]
    String(String),
    #[serde(rename = "timestamp_ns")]
    Time(i64),
}

impl Value {
    pub fn dtype(&self) -> DType {
        match self {
            Value::Bool(_) => DType::Bool,
            Value::Int(_) => DType::Int64,
            Value::Float(_) => DType::Float64,
            Value::String(_) => DType::String,
            Value::Time(_) => DType::TimestampNs,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Converts into `dtype`, allowing only the widening `Int64 -> Float64`.
    pub fn coerce(self, dtype: DType) -> Result<Value, Error> {
        match (self, dtype) {
            (Value::Int(value), DType::Float64) => Ok(Value::Float(value as f64)),
            (value, dtype) if value.dtype() == dtype => Ok(value),
            (value, dtype) => Err(Error::new(ErrorKind::TypeMismatch).with_message(format!(
                "cannot store {} value in a {} column",
                value.dtype(),
                dtype
            ))),
        }
    }

    pub fn from_time(value: OffsetDateTime) -> Value {
        Value::Time(value.unix_timestamp_nanos() as i64)
    }

    /// Plain JSON form; times render as RFC 3339 strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(value) => serde_json::Value::Bool(*value),
            Value::Int(value) => serde_json::Value::from(*value),
            Value::Float(value) => serde_json::Number::from_f64(*value)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(value) => serde_json::Value::String(value.clone()),
            Value::Time(value) => serde_json::Value::String(format_time_ns(*value)),
        }
    }

    /// Scalar JSON into a value; `None` for null, arrays and objects.
    pub fn from_json(value: &serde_json::Value) -> Option<Value> {
        match value {
            serde_json::Value::Bool(value) => Some(Value::Bool(*value)),
            serde_json::Value::Number(number) => match number.as_i64() {
                Some(value) => Some(Value::Int(value)),
                None => number.as_f64().map(Value::Float),
            },
            serde_json::Value::String(value) => Some(Value::String(value.clone())),
            _ => None,
        }
    }
}

/// RFC 3339 rendering with nanosecond precision.
pub fn format_time_ns(nanos: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .ok()
        .and_then(|time| time.format(&Rfc3339).ok())
        .unwrap_or_else(|| nanos.to_string())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::String(value) => f.write_str(value),
            Value::Time(value) => f.write_str(&format_time_ns(*value)),
        }
    }
}

macro_rules! int_value {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::Int(i64::from(value))
            }
        })*
    };
}

int_value!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(f64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<OffsetDateTime> for Value {
    fn from(value: OffsetDateTime) -> Self {
        Value::from_time(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{DType, Value, format_time_ns};
    use crate::core::error::ErrorKind;

    #[test]
    fn json_scalars_convert_both_ways() {
        assert_eq!(Value::from_json(&serde_json::json!(3)), Some(Value::Int(3)));
        assert_eq!(Value::from_json(&serde_json::json!(2.5)), Some(Value::Float(2.5)));
        assert_eq!(Value::from_json(&serde_json::json!(null)), None);
        assert_eq!(Value::Float(f64::NAN).to_json(), serde_json::Value::Null);
        assert_eq!(Value::Time(0).to_json(), serde_json::json!("1970-01-01T00:00:00Z"));
    }

    #[test]
    fn narrow_integers_widen_to_int64() {
        assert_eq!(Value::from(7u8), Value::Int(7));
        assert_eq!(Value::from(-3i32), Value::Int(-3));
        assert_eq!(Value::from(1.5f32), Value::Float(1.5));
    }

    #[test]
    fn coerce_allows_int_to_float_only() {
        assert_eq!(
            Value::Int(2).coerce(DType::Float64).expect("widen"),
            Value::Float(2.0)
        );
        let err = Value::Float(2.5)
            .coerce(DType::Int64)
            .expect_err("narrowing rejected");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn unknown_wire_dtype_is_rejected() {
        let err = DType::from_wire("decimal128").expect_err("unknown dtype");
        assert_eq!(err.kind(), ErrorKind::UnsupportedDType);
        assert_eq!(DType::from_wire("timestamp_ns").expect("known"), DType::TimestampNs);
    }

    #[test]
    fn time_renders_as_rfc3339() {
        assert_eq!(format_time_ns(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_time_ns(1_500_000_000), "1970-01-01T00:00:01.5Z");
    }

    #[test]
    fn float_null_fill_is_nan() {
        let Value::Float(value) = DType::Float64.null_value() else {
            panic!("expected float");
        };
        assert!(value.is_nan());
    }
}
