//! Core type definitions for the metadata model.

use relmap_proto::Value;
use serde::{Deserialize, Serialize};

/// Scalar data types a property can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    /// Boolean value.
    Bool,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit floating point.
    Float32,
    /// 64-bit floating point.
    Float64,
    /// UTF-8 string.
    String,
    /// Binary data.
    Bytes,
    /// Timestamp (microseconds since Unix epoch).
    Timestamp,
    /// UUID (128-bit identifier).
    Uuid,
}

impl ScalarType {
    /// Check if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ScalarType::Int32 | ScalarType::Int64 | ScalarType::Float32 | ScalarType::Float64
        )
    }

    /// Check if a value is acceptable for this type (NULL always is).
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (ScalarType::Bool, Value::Bool(_))
                | (ScalarType::Int32, Value::Int32(_))
                | (ScalarType::Int64, Value::Int64(_) | Value::Int32(_))
                | (ScalarType::Float32, Value::Float32(_))
                | (ScalarType::Float64, Value::Float64(_) | Value::Float32(_))
                | (ScalarType::String, Value::String(_))
                | (ScalarType::Bytes, Value::Bytes(_))
                | (ScalarType::Timestamp, Value::Timestamp(_))
                | (ScalarType::Uuid, Value::Uuid(_))
        )
    }

    /// Convert a value to this type where a lossless conversion exists.
    pub fn coerce(&self, value: Value) -> Value {
        match (self, value) {
            (ScalarType::Int64, Value::Int32(i)) => Value::Int64(i as i64),
            (ScalarType::Int32, Value::Int64(i)) => match i32::try_from(i) {
                Ok(i) => Value::Int32(i),
                Err(_) => Value::Int64(i),
            },
            (ScalarType::Float64, Value::Float32(f)) => Value::Float64(f as f64),
            (ScalarType::Bool, Value::Int32(i)) => Value::Bool(i != 0),
            (ScalarType::Bool, Value::Int64(i)) => Value::Bool(i != 0),
            (_, value) => value,
        }
    }
}

/// A scalar type plus nullability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyType {
    /// Underlying scalar type.
    pub scalar: ScalarType,
    /// Whether NULL is allowed.
    pub nullable: bool,
}

impl PropertyType {
    /// Create a required type.
    pub fn required(scalar: ScalarType) -> Self {
        Self {
            scalar,
            nullable: false,
        }
    }

    /// Create a nullable type.
    pub fn nullable(scalar: ScalarType) -> Self {
        Self {
            scalar,
            nullable: true,
        }
    }
}

/// When the store generates a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueGenerated {
    /// The application always supplies the value.
    #[default]
    Never,
    /// The store generates a value on insert.
    OnAdd,
    /// The store generates a value on insert and on every update.
    OnAddOrUpdate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts() {
        assert!(ScalarType::Int32.accepts(&Value::Null));
        assert!(ScalarType::Int64.accepts(&Value::Int32(1)));
        assert!(!ScalarType::String.accepts(&Value::Int32(1)));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(ScalarType::Int64.coerce(Value::Int32(4)), Value::Int64(4));
        assert_eq!(ScalarType::Int32.coerce(Value::Int64(4)), Value::Int32(4));
        assert_eq!(ScalarType::Bool.coerce(Value::Int64(1)), Value::Bool(true));
        assert_eq!(
            ScalarType::String.coerce(Value::from("x")),
            Value::from("x")
        );
    }
}
