//! InfluxDB v2 line protocol.
//!
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp_ns
//! ```
//!
//! See <https://docs.influxdata.com/influxdb/v2/reference/syntax/line-protocol/>.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::{Error, Result};

/// A value that can be stored in a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    /// Written with an `i` suffix.
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

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl FieldValue {
    fn write_to(&self, line: &mut String) -> Result<()> {
        match self {
            FieldValue::Float(v) => {
                if !v.is_finite() {
                    return Err(Error::InvalidPoint(format!(
                        "float field must be finite, got {v}"
                    )));
                }
                let _ = write!(line, "{v}");
            }
            FieldValue::Integer(v) => {
                let _ = write!(line, "{v}i");
            }
            FieldValue::String(v) => {
                line.push('"');
                for c in v.chars() {
                    if c == '"' || c == '\\' {
                        line.push('\\');
                    }
                    line.push(c);
                }
                line.push('"');
            }
            FieldValue::Boolean(v) => line.push_str(if *v { "true" } else { "false" }),
        }
        Ok(())
    }
}

/// A single data point. Tags and fields are kept sorted by key so the encoded line is
/// canonical.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp_ns: Option<i64>,
}

impl Point {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            ..Default::default()
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Nanoseconds since the unix epoch. Without it the server assigns its own time.
    pub fn timestamp_ns(mut self, timestamp_ns: i64) -> Self {
        self.timestamp_ns = Some(timestamp_ns);
        self
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Encodes the point as one line without the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        if self.measurement.is_empty() {
            return Err(Error::InvalidPoint("measurement is empty".to_string()));
        }
        if self.fields.is_empty() {
            return Err(Error::InvalidPoint(format!(
                "point for measurement {} has no fields",
                self.measurement
            )));
        }

        let mut line = String::with_capacity(64);
        escape_into(&mut line, &self.measurement, &[',', ' ']);

        // empty tag values are not representable
        for (key, value) in self.tags.iter().filter(|(_, v)| !v.is_empty()) {
            line.push(',');
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            escape_into(&mut line, value, &[',', '=', ' ']);
        }

        line.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            value.write_to(&mut line)?;
        }

        if let Some(ts) = self.timestamp_ns {
            let _ = write!(line, " {ts}");
        }
        Ok(line)
    }
}

/// Encodes a batch, one line per point.
pub fn encode(points: &[Point]) -> Result<String> {
    let mut body = String::new();
    for point in points {
        body.push_str(&point.to_line()?);
        body.push('\n');
    }
    Ok(body)
}

fn escape_into(line: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        match c {
            '\n' => line.push_str("\\n"),
            c if special.contains(&c) => {
                line.push('\\');
                line.push(c);
            }
            c => line.push(c),
        }
    }
}
