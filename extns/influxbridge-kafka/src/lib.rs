//! Kafka consumer for influxbridge, one message per poll with manual offset commits.

use bytes::Bytes;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};

mod source;

pub use source::KafkaConsumer;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("{0}")]
    Other(String),
}

/// Represents the authentication method used to connect to Kafka.
#[derive(Debug, Clone, PartialEq)]
pub enum KafkaAuth {
    Sasl {
        mechanism: String,
        username: String,
        password: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub consumer_group: String,
    /// `security.protocol`, e.g. `SASL_SSL`. Defaults to `SASL_SSL` when SASL auth is set
    /// and to the librdkafka default otherwise.
    pub security_protocol: Option<String>,
    pub auth: Option<KafkaAuth>,
}

/// A message read from Kafka.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaMessage {
    pub topic: String,
    /// The user payload, empty when the record had none.
    pub value: Bytes,
    pub partition: i32,
    pub offset: i64,
}

impl KafkaConfig {
    /// librdkafka settings for a manually committed consumer that starts from the latest
    /// offset when the group has no committed position.
    pub(crate) fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        // https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
        client_config
            .set("group.id", &self.consumer_group)
            .set("bootstrap.servers", self.brokers.join(","))
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .set_log_level(RDKafkaLogLevel::Warning);

        let protocol = match (&self.security_protocol, &self.auth) {
            (Some(protocol), _) => Some(protocol.as_str()),
            (None, Some(KafkaAuth::Sasl { .. })) => Some("SASL_SSL"),
            (None, None) => None,
        };
        if let Some(protocol) = protocol {
            client_config.set("security.protocol", protocol);
        }

        if let Some(KafkaAuth::Sasl {
            mechanism,
            username,
            password,
        }) = &self.auth
        {
            client_config
                .set("sasl.mechanisms", mechanism)
                .set("sasl.username", username)
                .set("sasl.password", password);
        }
        client_config
    }
}
