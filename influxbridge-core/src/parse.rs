//! Turns raw message payloads into [`ParsedRecord`]s. A malformed payload is an
//! [`Error::Parse`], which is never retried.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::Error;
use crate::error::Result;
use crate::record::{FieldValue, ParsedRecord};

/// Measurement written by the [`CandleParser`].
pub const CANDLE_MEASUREMENT: &str = "candles";

pub trait Parser: Send + Sync + 'static {
    fn parse(&self, payload: &[u8]) -> Result<ParsedRecord>;
}

/// Parser selected through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordParser {
    #[default]
    Candle,
    Json,
}

impl std::str::FromStr for RecordParser {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "candle" => Ok(RecordParser::Candle),
            "json" => Ok(RecordParser::Json),
            other => Err(Error::Config(format!(
                "unknown parser '{other}', expected 'candle' or 'json'"
            ))),
        }
    }
}

impl Parser for RecordParser {
    fn parse(&self, payload: &[u8]) -> Result<ParsedRecord> {
        match self {
            RecordParser::Candle => CandleParser.parse(payload),
            RecordParser::Json => JsonParser.parse(payload),
        }
    }
}

/// Parses OHLCV candles:
/// ```json
/// {"start": 1700000000, "high": 1.2, "low": 1.0, "open": 1.1, "close": 1.15,
///  "volume": 42.0, "product_id": "BTC-USD"}
/// ```
/// Numbers may also be sent as strings. `start` is in unix seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandleParser;

impl Parser for CandleParser {
    fn parse(&self, payload: &[u8]) -> Result<ParsedRecord> {
        let doc = object(payload)?;

        let start = doc
            .get("start")
            .ok_or_else(|| Error::Parse("candle has no 'start'".to_string()))?;
        let start = match start {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .ok_or_else(|| Error::Parse(format!("candle 'start' is not unix seconds: {start}")))?;
        let timestamp = Utc
            .timestamp_opt(start, 0)
            .single()
            .filter(|t| t.timestamp_nanos_opt().is_some())
            .ok_or_else(|| Error::Parse(format!("candle 'start' out of range: {start}")))?;

        let mut fields = BTreeMap::new();
        for key in ["high", "low", "open", "close", "volume"] {
            fields.insert(key.to_string(), FieldValue::Float(number(&doc, key)?));
        }

        let mut tags = BTreeMap::new();
        if let Some(product_id) = doc.get("product_id").and_then(Value::as_str) {
            tags.insert("product_id".to_string(), product_id.to_string());
        }

        ParsedRecord::new(CANDLE_MEASUREMENT, fields, tags, timestamp)
    }
}

/// Parses a generic document:
/// ```json
/// {"measurement": "cpu", "fields": {"load": 0.5}, "tags": {"host": "a"},
///  "timestamp": "2024-01-01T00:00:00Z"}
/// ```
/// `fields` must not be empty. `tags` is optional. `timestamp` is optional, RFC 3339 or
/// integer nanoseconds, and defaults to the time of parsing.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonParser;

impl Parser for JsonParser {
    fn parse(&self, payload: &[u8]) -> Result<ParsedRecord> {
        let doc = object(payload)?;

        let measurement = doc
            .get("measurement")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Parse("document has no string 'measurement'".to_string()))?;

        let mut fields = BTreeMap::new();
        let raw_fields = doc
            .get("fields")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::Parse("document has no 'fields' object".to_string()))?;
        if raw_fields.is_empty() {
            return Err(Error::Parse(format!("'{measurement}' has no fields")));
        }
        for (key, value) in raw_fields {
            let value = match value {
                Value::Bool(b) => FieldValue::Boolean(*b),
                Value::String(s) => FieldValue::String(s.clone()),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => FieldValue::Integer(i),
                    None => FieldValue::Float(n.as_f64().ok_or_else(|| {
                        Error::Parse(format!("field '{key}' is not a representable number"))
                    })?),
                },
                other => {
                    return Err(Error::Parse(format!(
                        "field '{key}' has unsupported value {other}"
                    )));
                }
            };
            fields.insert(key.clone(), value);
        }

        let mut tags = BTreeMap::new();
        if let Some(raw_tags) = doc.get("tags") {
            let raw_tags = raw_tags
                .as_object()
                .ok_or_else(|| Error::Parse("'tags' must be an object".to_string()))?;
            for (key, value) in raw_tags {
                let value = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(_) | Value::Bool(_) => value.to_string(),
                    other => {
                        return Err(Error::Parse(format!(
                            "tag '{key}' has unsupported value {other}"
                        )));
                    }
                };
                tags.insert(key.clone(), value);
            }
        }

        let timestamp = match doc.get("timestamp") {
            None | Some(Value::Null) => Utc::now(),
            Some(Value::String(s)) => {
                let timestamp = DateTime::parse_from_rfc3339(s)
                    .map_err(|e| Error::Parse(format!("timestamp '{s}' is not RFC 3339: {e}")))?
                    .with_timezone(&Utc);
                if timestamp.timestamp_nanos_opt().is_none() {
                    return Err(Error::Parse(format!(
                        "timestamp '{s}' does not fit in nanoseconds"
                    )));
                }
                timestamp
            }
            Some(Value::Number(n)) => {
                let nanos = n
                    .as_i64()
                    .ok_or_else(|| Error::Parse(format!("timestamp {n} is not integer nanos")))?;
                Utc.timestamp_nanos(nanos)
            }
            Some(other) => {
                return Err(Error::Parse(format!("unsupported timestamp {other}")));
            }
        };

        ParsedRecord::new(measurement, fields, tags, timestamp)
    }
}

fn object(payload: &[u8]) -> Result<Map<String, Value>> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::Parse(format!("expected a JSON object, got {other}"))),
        Err(e) => Err(Error::Parse(format!("invalid JSON: {e}"))),
    }
}

fn number(doc: &Map<String, Value>, key: &str) -> Result<f64> {
    let value = doc
        .get(key)
        .ok_or_else(|| Error::Parse(format!("missing '{key}'")))?;
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::Parse(format!("'{key}' is not a number: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candle() {
        let payload = br#"{"start": 1700000000, "high": 2.5, "low": "1.5", "open": 2,
            "close": 2.25, "volume": "100", "product_id": "BTC-USD"}"#;
        let record = CandleParser.parse(payload).unwrap();

        assert_eq!(record.measurement(), "candles");
        assert_eq!(record.timestamp().timestamp(), 1_700_000_000);
        assert_eq!(
            record.tags().get("product_id").map(String::as_str),
            Some("BTC-USD")
        );
        assert_eq!(record.fields().get("high"), Some(&FieldValue::Float(2.5)));
        assert_eq!(record.fields().get("low"), Some(&FieldValue::Float(1.5)));
        assert_eq!(record.fields().get("open"), Some(&FieldValue::Float(2.0)));
        assert_eq!(record.fields().get("volume"), Some(&FieldValue::Float(100.0)));
        assert_eq!(record.fields().len(), 5);
    }

    #[test]
    fn test_candle_start_as_string() {
        let payload = br#"{"start": "1700000060", "high": 1, "low": 1, "open": 1,
            "close": 1, "volume": 1}"#;
        let record = CandleParser.parse(payload).unwrap();
        assert_eq!(record.timestamp().timestamp(), 1_700_000_060);
        assert!(record.tags().is_empty());
    }

    #[test]
    fn test_candle_malformed() {
        assert!(matches!(
            CandleParser.parse(b"not json"),
            Err(Error::Parse(_))
        ));
        assert!(matches!(CandleParser.parse(b"[1,2]"), Err(Error::Parse(_))));
        assert!(matches!(
            CandleParser.parse(br#"{"start": 1, "high": "abc", "low": 1, "open": 1, "close": 1, "volume": 1}"#),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            CandleParser.parse(br#"{"high": 1, "low": 1, "open": 1, "close": 1, "volume": 1}"#),
            Err(Error::Parse(_))
        ));
        // year 3000
        assert!(matches!(
            CandleParser.parse(br#"{"start": 32503680000, "high": 1, "low": 1, "open": 1, "close": 1, "volume": 1}"#),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_json_document() {
        let payload = br#"{"measurement": "cpu", "fields": {"load": 0.5, "cores": 8,
            "ok": true, "state": "up"}, "tags": {"host": "a", "rack": 3},
            "timestamp": "2024-01-01T00:00:00Z"}"#;
        let record = JsonParser.parse(payload).unwrap();

        assert_eq!(record.measurement(), "cpu");
        assert_eq!(record.fields().get("load"), Some(&FieldValue::Float(0.5)));
        assert_eq!(record.fields().get("cores"), Some(&FieldValue::Integer(8)));
        assert_eq!(record.fields().get("ok"), Some(&FieldValue::Boolean(true)));
        assert_eq!(
            record.fields().get("state"),
            Some(&FieldValue::String("up".into()))
        );
        assert_eq!(record.tags().get("rack").map(String::as_str), Some("3"));
        assert_eq!(record.timestamp().to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_json_nanosecond_timestamp() {
        let payload = br#"{"measurement": "m", "fields": {"v": 1}, "timestamp": 1500000000}"#;
        let record = JsonParser.parse(payload).unwrap();
        assert_eq!(record.timestamp().timestamp_nanos_opt(), Some(1_500_000_000));
    }

    #[test]
    fn test_json_malformed() {
        for payload in [
            &br#"{"fields": {"v": 1}}"#[..],
            br#"{"measurement": "", "fields": {"v": 1}}"#,
            br#"{"measurement": "m"}"#,
            br#"{"measurement": "m", "fields": {"v": [1]}}"#,
            br#"{"measurement": "m", "fields": {"v": 1}, "timestamp": "yesterday"}"#,
            br#"{"measurement": "m", "fields": {}}"#,
            br#"{"measurement": "m", "fields": {"v": 1}, "timestamp": "3000-01-01T00:00:00Z"}"#,
        ] {
            assert!(
                matches!(JsonParser.parse(payload), Err(Error::Parse(_))),
                "{}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn test_record_parser_from_str() {
        assert_eq!("candle".parse::<RecordParser>().unwrap(), RecordParser::Candle);
        assert_eq!("JSON".parse::<RecordParser>().unwrap(), RecordParser::Json);
        assert!(matches!(
            "xml".parse::<RecordParser>(),
            Err(Error::Config(_))
        ));
    }
}
