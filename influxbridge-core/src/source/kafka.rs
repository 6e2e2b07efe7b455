use std::time::Duration;

use influxbridge_kafka::KafkaConsumer;

use crate::error::Result;
use crate::source::{MessageSource, RawMessage, SourceOffset};

impl MessageSource for KafkaConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        Ok(KafkaConsumer::subscribe(self, topics.to_vec()).await?)
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<RawMessage>> {
        let message = KafkaConsumer::poll(self, timeout).await?;
        Ok(message.map(|message| RawMessage {
            payload: message.value,
            offset: SourceOffset {
                topic: message.topic,
                partition: message.partition,
                offset: message.offset,
            },
        }))
    }

    async fn commit(&self, offset: &SourceOffset) -> Result<()> {
        Ok(KafkaConsumer::commit(self, &offset.topic, offset.partition, offset.offset).await?)
    }

    async fn close(&self) -> Result<()> {
        Ok(KafkaConsumer::close(self).await?)
    }

    async fn ping(&self, timeout: Duration) -> Result<()> {
        Ok(KafkaConsumer::ping(self, timeout).await?)
    }
}
