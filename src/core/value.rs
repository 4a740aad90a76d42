// Copyright 2025 Stoolap Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Scalar values produced by result set iteration and carried by literals

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::types::DataType;

/// A decoded scalar value
#[derive(Debug, Clone)]
pub enum Value {
    /// NULL value with a type hint
    Null(DataType),

    /// Any integer-backed value (integers, decimals, dates, timestamps)
    Integer(i64),

    /// Floating point value
    Float(f64),

    /// UTF-8 text (Arc for cheap cloning)
    Text(Arc<str>),

    Boolean(bool),
}

impl Value {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a NULL value with a type hint
    pub fn null(data_type: DataType) -> Self {
        Value::Null(data_type)
    }

    pub fn integer(value: i64) -> Self {
        Value::Integer(value)
    }

    pub fn float(value: f64) -> Self {
        Value::Float(value)
    }

    pub fn text(value: impl AsRef<str>) -> Self {
        Value::Text(Arc::from(value.as_ref()))
    }

    pub fn boolean(value: bool) -> Self {
        Value::Boolean(value)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Returns true if this value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }

    /// Extract as i64, converting floats and booleans
    pub fn as_int64(&self) -> Option<i64> {
        match self {
            Value::Null(_) | Value::Text(_) => None,
            Value::Integer(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            Value::Boolean(b) => Some(i64::from(*b)),
        }
    }

    /// Extract as f64, converting integers and booleans
    pub fn as_float64(&self) -> Option<f64> {
        match self {
            Value::Null(_) | Value::Text(_) => None,
            Value::Integer(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
        }
    }

    /// Borrow the text payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Ordering used by ORDER BY over decoded values; `None` when either side
    /// is NULL or the types cannot be compared
    pub fn sql_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Null(_), _) | (_, Value::Null(_)) => None,
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => Some(a.total_cmp(b)),
            (Value::Integer(i), Value::Float(f)) => Some((*i as f64).total_cmp(f)),
            (Value::Float(f), Value::Integer(i)) => Some(f.total_cmp(&(*i as f64))),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null(DataType::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null(_) => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
            Value::Boolean(b) => write!(f, "{}", if *b { "true" } else { "false" }),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        // NULL equals NULL here; SQL three-valued logic is the engine's concern
        match (self, other) {
            (Value::Null(_), Value::Null(_)) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits() || a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null(dt) => dt.hash(state),
            Value::Integer(v) => v.hash(state),
            // -0.0 and 0.0 compare equal, so hash them alike
            Value::Float(v) => {
                if *v == 0.0 {
                    0u64.hash(state)
                } else {
                    v.to_bits().hash(state)
                }
            }
            Value::Text(s) => s.hash(state),
            Value::Boolean(b) => b.hash(state),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null(DataType::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_equality() {
        assert_eq!(Value::integer(3), Value::from(3i64));
        assert_eq!(Value::null(DataType::BigInt), Value::null(DataType::Double));
        assert_ne!(Value::integer(1), Value::float(1.0));
        assert_eq!(Value::text("a"), Value::from("a"));
        assert_eq!(Value::from(None::<i64>), Value::null(DataType::Null));
    }

    #[test]
    fn test_sql_cmp() {
        assert_eq!(Value::integer(1).sql_cmp(&Value::integer(2)), Some(Ordering::Less));
        assert_eq!(Value::float(2.5).sql_cmp(&Value::integer(2)), Some(Ordering::Greater));
        assert_eq!(Value::text("b").sql_cmp(&Value::text("a")), Some(Ordering::Greater));
        assert_eq!(Value::null(DataType::Integer).sql_cmp(&Value::integer(1)), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::integer(-4).to_string(), "-4");
        assert_eq!(Value::null(DataType::Text).to_string(), "NULL");
        assert_eq!(Value::boolean(true).to_string(), "true");
    }
}
