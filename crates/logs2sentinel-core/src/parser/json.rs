//! Guarded JSON log parser
//!
//! Two DoS vectors are closed before any record is produced: payload size is
//! checked before decoding, and nesting depth (objects + arrays) is checked
//! after. Nested containers that survive the guards are collapsed into
//! JSON-encoded strings, keeping the record a flat scalar map.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ParseError;
use crate::parser::{LogParser, MetricsSnapshot, ParserMetrics};
use crate::record::{Record, Scalar};
use crate::table::SemanticType;

pub const DEFAULT_MAX_SIZE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_DEPTH: usize = 50;

// serde_json refuses to decode anything nested deeper than this, so a
// measured depth is always available below it.
const DECODER_DEPTH_LIMIT: usize = 128;

/// Optional shape requirements applied after decoding.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub types: BTreeMap<String, SemanticType>,
}

/// Parser for JSON-object log payloads.
#[derive(Debug)]
pub struct JsonParser {
    schema: Option<JsonSchema>,
    max_size_bytes: usize,
    max_depth: usize,
    metrics: ParserMetrics,
}

impl Default for JsonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonParser {
    pub fn new() -> Self {
        Self {
            schema: None,
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            max_depth: DEFAULT_MAX_DEPTH,
            metrics: ParserMetrics::default(),
        }
    }

    pub fn with_schema(mut self, schema: JsonSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_max_size_bytes(mut self, max_size_bytes: usize) -> Self {
        self.max_size_bytes = max_size_bytes;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    fn parse_inner(&self, data: &[u8]) -> Result<Record, ParseError> {
        if data.len() > self.max_size_bytes {
            tracing::warn!(
                payload_size = data.len(),
                max_size = self.max_size_bytes,
                "JSON size limit exceeded"
            );
            return Err(ParseError::PayloadTooLarge {
                size: data.len(),
                max_size: self.max_size_bytes,
            });
        }

        let value: Value = serde_json::from_slice(data).map_err(|e| {
            if e.to_string().contains("recursion limit") {
                ParseError::TooDeep {
                    depth: DECODER_DEPTH_LIMIT,
                    max_depth: self.max_depth,
                }
            } else {
                ParseError::Json(e)
            }
        })?;

        let depth = measure_depth(&value, 1, self.max_depth);
        if depth > self.max_depth {
            return Err(ParseError::TooDeep {
                depth,
                max_depth: self.max_depth,
            });
        }

        let object = match value {
            Value::Object(map) => map,
            _ => return Err(ParseError::NotAnObject),
        };

        let mut record = Record::new();
        for (key, value) in object {
            let scalar = match value {
                Value::Array(_) | Value::Object(_) => {
                    // Flatten surviving containers into their JSON text.
                    Scalar::String(serde_json::to_string(&value)?)
                }
                scalar => Scalar::from_json(scalar).map_err(|message| ParseError::Field {
                    field: key.clone(),
                    message,
                })?,
            };
            record.insert(key, scalar);
        }

        if let Some(schema) = &self.schema {
            apply_schema(&record, schema)?;
        }

        Ok(record)
    }
}

impl LogParser for JsonParser {
    fn parse(&self, data: &[u8]) -> Result<Record, ParseError> {
        match self.parse_inner(data) {
            Ok(record) => {
                self.metrics.record_parsed();
                Ok(record)
            }
            Err(e) => {
                self.metrics.record_failure(&e);
                Err(e)
            }
        }
    }

    fn validate(&self, record: &Record) -> bool {
        let Some(schema) = &self.schema else {
            return true;
        };

        for field in &schema.required {
            if !record.contains_key(field) {
                return false;
            }
        }

        for (field, expected) in &schema.types {
            if let Some(value) = record.get(field) {
                if !type_matches(value, *expected) {
                    return false;
                }
            }
        }

        true
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn apply_schema(record: &Record, schema: &JsonSchema) -> Result<(), ParseError> {
    for field in &schema.required {
        if !record.contains_key(field) {
            return Err(ParseError::MissingField(field.clone()));
        }
    }

    for (field, expected) in &schema.types {
        if let Some(value) = record.get(field) {
            if !type_matches(value, *expected) {
                return Err(ParseError::SchemaType {
                    field: field.clone(),
                    expected: expected.as_str(),
                    actual: value.type_name(),
                });
            }
        }
    }

    Ok(())
}

fn type_matches(value: &Scalar, expected: SemanticType) -> bool {
    match expected {
        SemanticType::Long => matches!(value, Scalar::Int(_)),
        SemanticType::Double => matches!(value, Scalar::Float(_) | Scalar::Int(_)),
        SemanticType::Boolean => matches!(value, Scalar::Bool(_)),
        SemanticType::String => matches!(value, Scalar::String(_)),
        SemanticType::Datetime => match value {
            Scalar::Timestamp(_) => true,
            Scalar::String(s) => DateTime::parse_from_rfc3339(s).is_ok(),
            _ => false,
        },
    }
}

fn measure_depth(value: &Value, current: usize, max_depth: usize) -> usize {
    // Early exit once past the limit; the caller only needs "over".
    if current > max_depth {
        return current;
    }
    match value {
        Value::Object(map) => map
            .values()
            .map(|v| measure_depth(v, current + 1, max_depth))
            .max()
            .unwrap_or(current),
        Value::Array(items) => items
            .iter()
            .map(|v| measure_depth(v, current + 1, max_depth))
            .max()
            .unwrap_or(current),
        _ => current,
    }
}
