//! Typed state values.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A value held by an attribute or carried by an event field.
///
/// In definition documents values are written externally tagged:
/// `{int: 5}`, `{long: 5}`, `{double: 0.5}`, `{string: "x"}` or `null`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    String(String),
    Int(i32),
    Long(i64),
    Double(f64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the value kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::String(_) => "string",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Double(_) => "double",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a 64-bit integer if it is an integral kind.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Compares two values by their natural order.
    ///
    /// Integral kinds compare across widths, doubles use a total order, strings
    /// compare lexicographically. Returns `None` when the kinds are not comparable
    /// (including any comparison involving `Null`).
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Double(a), Value::Double(b)) => Some(a.total_cmp(b)),
            (Value::Double(a), b) => b.as_i64().map(|b| a.total_cmp(&(b as f64))),
            (a, Value::Double(b)) => a.as_i64().map(|a| (a as f64).total_cmp(b)),
            (a, b) => a.as_i64().zip(b.as_i64()).map(|(a, b)| a.cmp(&b)),
        }
    }

    /// Equality under the natural order; `Null` only equals `Null`.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }

    /// Renders the value as an attribute name. `Null` has no name.
    pub fn as_name(&self) -> Option<String> {
        match self {
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::String(s) => f.write_str(s),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_compare_across_widths() {
        assert_eq!(Value::Int(5).compare(&Value::Long(5)), Some(Ordering::Equal));
        assert_eq!(Value::Long(4).compare(&Value::Int(5)), Some(Ordering::Less));
        assert_eq!(
            Value::Double(5.5).compare(&Value::Int(5)),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_string_compare() {
        assert_eq!(
            Value::from("abc").compare(&Value::from("abd")),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_mismatched_kinds() {
        assert_eq!(Value::from("5").compare(&Value::Int(5)), None);
        assert_eq!(Value::Null.compare(&Value::Int(5)), None);
        assert!(!Value::Null.same_as(&Value::Int(0)));
        assert!(Value::Null.same_as(&Value::Null));
    }

    #[test]
    fn test_as_name() {
        assert_eq!(Value::Int(42).as_name().as_deref(), Some("42"));
        assert_eq!(Value::from("cpu0").as_name().as_deref(), Some("cpu0"));
        assert_eq!(Value::Null.as_name(), None);
    }

    #[test]
    fn test_serde_tagged_form() {
        let v: Value = serde_json::from_value(serde_json::json!({"int": 3})).unwrap();
        assert_eq!(v, Value::Int(3));
        let v: Value = serde_json::from_value(serde_json::json!("null")).unwrap();
        assert_eq!(v, Value::Null);
    }
}
