//! The typed record that flows from the parser through the batch queue to the sink.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Error;
use crate::error::Result;

/// Value of a single field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    String(String),
    Boolean(bool),
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

/// A parsed record. Immutable once built, the measurement is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    measurement: String,
    fields: BTreeMap<String, FieldValue>,
    tags: BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
}

impl ParsedRecord {
    pub fn new(
        measurement: impl Into<String>,
        fields: BTreeMap<String, FieldValue>,
        tags: BTreeMap<String, String>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let measurement = measurement.into();
        if measurement.is_empty() {
            return Err(Error::Parse("measurement must not be empty".to_string()));
        }
        Ok(Self {
            measurement,
            fields,
            tags,
            timestamp,
        })
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_measurement_is_rejected() {
        let result = ParsedRecord::new("", BTreeMap::new(), BTreeMap::new(), Utc::now());
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn test_empty_maps_are_allowed() {
        let now = Utc::now();
        let record = ParsedRecord::new("cpu", BTreeMap::new(), BTreeMap::new(), now).unwrap();
        assert_eq!(record.measurement(), "cpu");
        assert!(record.fields().is_empty());
        assert!(record.tags().is_empty());
        assert_eq!(record.timestamp(), now);
    }

    #[test]
    fn test_field_values_serialize_untagged() {
        let fields: BTreeMap<String, FieldValue> = [
            ("f".to_string(), FieldValue::from(1.5)),
            ("i".to_string(), FieldValue::from(7i64)),
            ("s".to_string(), FieldValue::from("x")),
            ("b".to_string(), FieldValue::from(false)),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            serde_json::to_string(&fields).unwrap(),
            r#"{"b":false,"f":1.5,"i":7,"s":"x"}"#
        );
    }
}
