//! Tagged-scalar record model
//!
//! A record is a flat field-name → scalar mapping. Parsers produce records,
//! the sink transforms and serializes them. The map is ordered (BTreeMap) so
//! that serialization is deterministic, which the batch content hash relies
//! on.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// A single record field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
}

/// A parsed log record.
pub type Record = BTreeMap<String, Scalar>;

impl Scalar {
    /// Variant name used in error messages and drop reasons.
    pub fn type_name(&self) -> &'static str {
        match self {
            Scalar::Null => "null",
            Scalar::Bool(_) => "bool",
            Scalar::Int(_) => "int",
            Scalar::Float(_) => "float",
            Scalar::String(_) => "string",
            Scalar::Timestamp(_) => "timestamp",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render a timestamp as RFC 3339 UTC with a trailing `Z`.
    pub fn to_rfc3339(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scalar::Null => serializer.serialize_unit(),
            Scalar::Bool(b) => serializer.serialize_bool(*b),
            Scalar::Int(i) => serializer.serialize_i64(*i),
            Scalar::Float(f) => serializer.serialize_f64(*f),
            Scalar::String(s) => serializer.serialize_str(s),
            Scalar::Timestamp(ts) => serializer.serialize_str(&Scalar::to_rfc3339(ts)),
        }
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Scalar::from_json(value).map_err(de::Error::custom)
    }
}

impl Scalar {
    /// Convert a JSON value into a scalar. Strings that parse as RFC 3339
    /// timestamps stay strings; the sink's type coercion promotes them when a
    /// table schema asks for `datetime`. Nested containers are rejected.
    pub fn from_json(value: serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::Null => Ok(Scalar::Null),
            serde_json::Value::Bool(b) => Ok(Scalar::Bool(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Scalar::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Scalar::Float(f))
                } else {
                    Err(format!("unrepresentable number: {}", n))
                }
            }
            serde_json::Value::String(s) => Ok(Scalar::String(s)),
            other => Err(format!(
                "expected a scalar, got {}",
                match other {
                    serde_json::Value::Array(_) => "an array",
                    serde_json::Value::Object(_) => "an object",
                    _ => "a non-scalar",
                }
            )),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::String(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::String(s)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<f64> for Scalar {
    fn from(f: f64) -> Self {
        Scalar::Float(f)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

impl From<DateTime<Utc>> for Scalar {
    fn from(ts: DateTime<Utc>) -> Self {
        Scalar::Timestamp(ts)
    }
}

/// Approximate serialized size of a record, used for byte-bounded batching.
pub fn record_json_size(record: &Record) -> usize {
    // Cheap upper-bound estimate; batch limits do not need exact JSON sizes.
    record
        .iter()
        .map(|(k, v)| {
            let value_len = match v {
                Scalar::Null => 4,
                Scalar::Bool(_) => 5,
                Scalar::Int(_) | Scalar::Float(_) => 24,
                Scalar::String(s) => s.len() + 2,
                Scalar::Timestamp(_) => 32,
            };
            k.len() + value_len + 6
        })
        .sum::<usize>()
        + 2
}
