//! InfluxDB v2 client used by influxbridge.
//!
//! Points are encoded with the [line protocol](line_protocol) and shipped over the v2 HTTP
//! API. Besides writes, the [`InfluxClient`] can ping the server and list or create the
//! organizations and buckets the writes go to.

use std::time::Duration;

mod client;
pub mod line_protocol;

pub use client::{Bucket, InfluxClient, Organization};
pub use line_protocol::{FieldValue, Point};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid point - {0}")]
    InvalidPoint(String),

    #[error("Building InfluxDB client for {url} - {error}")]
    Client { url: String, error: String },

    #[error("InfluxDB request - {0}")]
    Http(String),

    #[error("InfluxDB responded with status {status} - {body}")]
    Status { status: u16, body: String },

    /// The resource being created already exists.
    #[error("InfluxDB conflict - {0}")]
    Conflict(String),

    #[error("Decoding InfluxDB response - {0}")]
    Decode(String),
}

impl Error {
    /// Whether a later attempt with the same input could succeed. Transport errors, throttling
    /// and server errors are; malformed points and other client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::Status { status, .. } => *status == 429 || *status >= 500,
            Error::InvalidPoint(_)
            | Error::Client { .. }
            | Error::Conflict(_)
            | Error::Decode(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfluxConfig {
    /// Base URL of the server, e.g. `http://localhost:8086`.
    pub url: String,
    /// API token sent as `Authorization: Token <token>`.
    pub token: Option<String>,
    pub org: String,
    pub bucket: String,
    /// Per request timeout.
    pub timeout: Duration,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            token: None,
            org: String::new(),
            bucket: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}
