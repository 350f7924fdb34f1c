use serde::{Deserialize, Serialize};

/// Dynamically typed cell used in filters and result rows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Timestamp(i64),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::Timestamp(v) => Some(*v),
            Value::Float64(v) => Some(*v as i64),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            Value::Int64(v) => Some(*v as f64),
            Value::Timestamp(v) => Some(*v as f64),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert a JSON scalar; nested arrays and objects collapse to NULL
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int64(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float64(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => Value::Null,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int64(i) => serde_json::json!(i),
            Value::Float64(f) => serde_json::json!(f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(t) => serde_json::json!(t),
        }
    }

    /// Timestamp interpreted as milliseconds since the epoch.
    ///
    /// Integers below 1e11 are taken to be seconds, which is what most
    /// time-series engines hand back for coarse data.
    pub fn as_epoch_millis(&self) -> Option<i64> {
        match self {
            Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis()),
            Value::Float64(f) if f.abs() < 1e11 => Some((*f * 1000.0) as i64),
            other => other.as_i64().map(|v| {
                if v.unsigned_abs() < 100_000_000_000 {
                    v * 1000
                } else {
                    v
                }
            }),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Int64(a), Value::Float64(b)) => (*a as f64).to_bits() == b.to_bits(),
            (Value::Float64(a), Value::Int64(b)) => a.to_bits() == (*b as f64).to_bits(),
            (Value::Int64(a), Value::Timestamp(b)) => a == b,
            (Value::Timestamp(a), Value::Int64(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int64(i) => write!(f, "{}", i),
            Value::Float64(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Timestamp(t) => write!(f, "{}", t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json() {
        assert!(matches!(Value::from_json(&serde_json::json!(42)), Value::Int64(42)));
        assert!(matches!(Value::from_json(&serde_json::json!(3.5)), Value::Float64(_)));
        assert!(matches!(Value::from_json(&serde_json::json!("x")), Value::String(_)));
        assert!(Value::from_json(&serde_json::json!({"a": 1})).is_null());
    }

    #[test]
    fn test_epoch_millis_scaling() {
        assert_eq!(Value::Int64(1_700_000_000).as_epoch_millis(), Some(1_700_000_000_000));
        assert_eq!(Value::Timestamp(1_700_000_000_123).as_epoch_millis(), Some(1_700_000_000_123));
        assert_eq!(
            Value::from("2023-11-14T22:13:20Z").as_epoch_millis(),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn test_cross_type_equality() {
        assert_eq!(Value::Int64(5), Value::Timestamp(5));
        assert_eq!(Value::Int64(2), Value::Float64(2.0));
        assert_ne!(Value::from("2"), Value::Int64(2));
    }
}
