//! Typed attribute values.
//!
//! An attribute carries both its declared type tag and its value, so the wire
//! encoding is chosen from the tag instead of by inspecting the value.

use crate::error::{VbusError, VbusResult};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Declared type of an attribute, as recorded in `schema.properties.<key>.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Boolean,
    Integer,
    String,
    Number,
}

impl AttributeType {
    /// The schema name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::Boolean => "boolean",
            AttributeType::Integer => "integer",
            AttributeType::String => "string",
            AttributeType::Number => "number",
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttributeType {
    type Err = VbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boolean" => Ok(AttributeType::Boolean),
            "integer" => Ok(AttributeType::Integer),
            "string" => Ok(AttributeType::String),
            "number" => Ok(AttributeType::Number),
            other => Err(VbusError::UnsupportedValue(format!(
                "type not supported: {other}"
            ))),
        }
    }
}

/// A typed scalar attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Boolean(bool),
    Integer(i64),
    String(String),
    Number(f64),
}

impl AttributeValue {
    /// The type tag of this value.
    pub fn attr_type(&self) -> AttributeType {
        match self {
            AttributeValue::Boolean(_) => AttributeType::Boolean,
            AttributeValue::Integer(_) => AttributeType::Integer,
            AttributeValue::String(_) => AttributeType::String,
            AttributeValue::Number(_) => AttributeType::Number,
        }
    }

    /// Fails for numbers JSON cannot carry (NaN and the infinities).
    pub fn ensure_representable(&self) -> VbusResult<()> {
        match self {
            AttributeValue::Number(n) if !n.is_finite() => {
                Err(VbusError::UnsupportedValue(n.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Bare wire text (not JSON-quoted).
    pub fn to_wire(&self) -> String {
        match self {
            AttributeValue::Boolean(b) => b.to_string(),
            AttributeValue::Integer(i) => i.to_string(),
            AttributeValue::String(s) => s.clone(),
            AttributeValue::Number(n) => n.to_string(),
        }
    }

    /// Parse bare wire text according to the declared type.
    pub fn parse_wire(ty: AttributeType, text: &str) -> VbusResult<Self> {
        let invalid = || VbusError::Protocol(format!("cannot parse {text:?} as {ty}"));
        match ty {
            AttributeType::Boolean => parse_bool(text.trim())
                .map(AttributeValue::Boolean)
                .ok_or_else(invalid),
            AttributeType::Integer => text
                .trim()
                .parse::<i64>()
                .map(AttributeValue::Integer)
                .map_err(|_| invalid()),
            AttributeType::String => Ok(AttributeValue::String(text.to_string())),
            AttributeType::Number => {
                let n = text.trim().parse::<f64>().map_err(|_| invalid())?;
                let value = AttributeValue::Number(n);
                value.ensure_representable()?;
                Ok(value)
            }
        }
    }

    /// Infer a typed value from a JSON scalar.
    ///
    /// Integral numbers become `Integer`, other numbers `Number`. Null,
    /// arrays and objects are not attributes.
    pub fn from_json(value: &Value) -> VbusResult<Self> {
        match value {
            Value::Bool(b) => Ok(AttributeValue::Boolean(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(AttributeValue::Integer(i))
                } else {
                    n.as_f64()
                        .map(AttributeValue::Number)
                        .ok_or_else(|| VbusError::UnsupportedValue(n.to_string()))
                }
            }
            Value::String(s) => Ok(AttributeValue::String(s.clone())),
            other => Err(VbusError::UnsupportedValue(other.to_string())),
        }
    }

    /// Read a stored JSON value under a declared type.
    ///
    /// A stored integral number is accepted for a `number` attribute, since
    /// JSON does not distinguish `2` from `2.0`.
    pub fn from_json_typed(ty: AttributeType, value: &Value) -> Option<Self> {
        match (ty, value) {
            (AttributeType::Boolean, Value::Bool(b)) => Some(AttributeValue::Boolean(*b)),
            (AttributeType::Integer, Value::Number(n)) => n.as_i64().map(AttributeValue::Integer),
            (AttributeType::String, Value::String(s)) => Some(AttributeValue::String(s.clone())),
            (AttributeType::Number, Value::Number(n)) => n.as_f64().map(AttributeValue::Number),
            _ => None,
        }
    }

    /// JSON form of the value, as stored in node content.
    pub fn to_json(&self) -> Value {
        match self {
            AttributeValue::Boolean(b) => Value::Bool(*b),
            AttributeValue::Integer(i) => Value::from(*i),
            AttributeValue::String(s) => Value::String(s.clone()),
            AttributeValue::Number(n) => {
                serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number)
            }
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Boolean(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Integer(i)
    }
}

impl From<i32> for AttributeValue {
    fn from(i: i32) -> Self {
        AttributeValue::Integer(i64::from(i))
    }
}

impl From<f64> for AttributeValue {
    fn from(n: f64) -> Self {
        AttributeValue::Number(n)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

/// Parse a boolean the way the authorization service formats it.
pub fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
