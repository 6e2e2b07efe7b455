//! The partitioned message log the pipeline consumes from.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;

/// Kafka implementation of [`MessageSource`].
pub(crate) mod kafka;

#[cfg(test)]
pub(crate) mod test_utils;

/// Position of a message in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for SourceOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}@{}", self.topic, self.partition, self.offset)
    }
}

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub payload: Bytes,
    pub offset: SourceOffset,
}

/// Manually committed message source.
#[trait_variant::make(MessageSource: Send)]
#[allow(dead_code)]
pub trait LocalMessageSource {
    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    /// Waits up to `timeout` for one message, `None` when nothing arrived.
    async fn poll(&self, timeout: Duration) -> Result<Option<RawMessage>>;

    /// Marks the message at `offset` as processed.
    async fn commit(&self, offset: &SourceOffset) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Succeeds when the brokers answer within `timeout`.
    async fn ping(&self, timeout: Duration) -> Result<()>;
}
