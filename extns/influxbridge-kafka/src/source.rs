use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{Error, KafkaConfig, KafkaMessage, Result};

// A context can be used to change the behavior of consumers by adding callbacks
// that will be executed by librdkafka.
struct KafkaContext;

impl ClientContext for KafkaContext {}

impl ConsumerContext for KafkaContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Pre rebalance {:?}", rebalance);
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Post rebalance {:?}", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(?e, "Committing offsets failed");
        }
    }
}

type BridgeConsumer = StreamConsumer<KafkaContext>;

/// Highest offset committed so far per topic partition. Commits complete out of order because
/// messages are processed concurrently, a commit at or below the high mark would move the
/// group position backwards and is skipped.
#[derive(Debug, Default)]
struct CommitTracker {
    committed: HashMap<(String, i32), i64>,
}

impl CommitTracker {
    /// Records `offset` and returns whether it should be committed.
    fn advance(&mut self, topic: &str, partition: i32, offset: i64) -> bool {
        match self.committed.get_mut(&(topic.to_string(), partition)) {
            Some(current) if *current >= offset => false,
            Some(current) => {
                *current = offset;
                true
            }
            None => {
                self.committed.insert((topic.to_string(), partition), offset);
                true
            }
        }
    }
}

enum KafkaActorMessage {
    Subscribe {
        topics: Vec<String>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Poll {
        timeout: Duration,
        respond_to: oneshot::Sender<Result<Option<KafkaMessage>>>,
    },
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Close {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

struct KafkaActor {
    consumer: Arc<BridgeConsumer>,
    commits: CommitTracker,
    handler_rx: mpsc::Receiver<KafkaActorMessage>,
}

impl KafkaActor {
    fn start(consumer: Arc<BridgeConsumer>, handler_rx: mpsc::Receiver<KafkaActorMessage>) {
        let actor = KafkaActor {
            consumer,
            commits: CommitTracker::default(),
            handler_rx,
        };
        tokio::spawn(async move {
            info!("Starting Kafka consumer...");
            actor.run().await;
            info!("Kafka consumer stopped");
        });
    }

    // returns when every handle is dropped or the consumer is closed
    async fn run(mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            if !self.handle_message(msg).await {
                break;
            }
        }
    }

    /// Returns false once the consumer has been closed.
    async fn handle_message(&mut self, msg: KafkaActorMessage) -> bool {
        match msg {
            KafkaActorMessage::Subscribe { topics, respond_to } => {
                let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
                let status = self
                    .consumer
                    .subscribe(&topics)
                    .map_err(|err| Error::Kafka(format!("Failed to subscribe to topics: {err}")));
                let _ = respond_to.send(status);
            }
            KafkaActorMessage::Poll {
                timeout,
                respond_to,
            } => {
                let message = self.poll(timeout).await;
                let _ = respond_to.send(message);
            }
            KafkaActorMessage::Commit {
                topic,
                partition,
                offset,
                respond_to,
            } => {
                let status = self.commit(&topic, partition, offset);
                let _ = respond_to.send(status);
            }
            KafkaActorMessage::Close { respond_to } => {
                self.consumer.unsubscribe();
                let _ = respond_to.send(Ok(()));
                return false;
            }
        }
        true
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<KafkaMessage>> {
        let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) => return Err(Error::Kafka(format!("Failed to read message: {e}"))),
            Ok(Ok(message)) => message,
        };

        let value = match message.payload() {
            Some(payload) => Bytes::copy_from_slice(payload),
            None => Bytes::new(),
        };
        Ok(Some(KafkaMessage {
            topic: message.topic().to_string(),
            value,
            partition: message.partition(),
            offset: message.offset(),
        }))
    }

    fn commit(&mut self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        if !self.commits.advance(topic, partition, offset) {
            debug!(topic, partition, offset, "Offset already covered by a later commit");
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        // the committed position is the next offset to read
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| Error::Kafka(format!("Failed to add partition offset: {e}")))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| Error::Kafka(format!("Failed to commit offsets: {e}")))
    }
}

/// Handle to the Kafka consumer actor. Cheap to clone, every clone talks to the same consumer.
#[derive(Clone)]
pub struct KafkaConsumer {
    actor_tx: mpsc::Sender<KafkaActorMessage>,
    // metadata requests bypass the actor, which may be blocked in a poll
    consumer: Arc<BridgeConsumer>,
    group: String,
}

impl KafkaConsumer {
    pub fn connect(config: KafkaConfig) -> Result<Self> {
        let consumer: Arc<BridgeConsumer> = Arc::new(
            config
                .client_config()
                .create_with_context(KafkaContext)
                .map_err(|err| Error::Connection {
                    server: config.brokers.join(","),
                    error: err.to_string(),
                })?,
        );

        let (tx, rx) = mpsc::channel(10);
        KafkaActor::start(Arc::clone(&consumer), rx);
        Ok(Self {
            actor_tx: tx,
            consumer,
            group: config.consumer_group,
        })
    }

    /// Asks the brokers for the consumer group, failing when they do not answer within
    /// `timeout`.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let consumer = Arc::clone(&self.consumer);
        let group = self.group.clone();
        // fetch_group_list blocks until the brokers answer or the timeout expires
        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_group_list(Some(&group), timeout)
                .map(|_| ())
                .map_err(|e| Error::Kafka(format!("Failed to list consumer groups: {e}")))
        })
        .await
        .map_err(|e| Error::Other(format!("Waiting for group list: {e:?}")))?
    }

    async fn request<T>(
        &self,
        msg: KafkaActorMessage,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.actor_tx
            .send(msg)
            .await
            .map_err(|_| Error::Other("Kafka consumer is closed".into()))?;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }

    pub async fn subscribe(&self, topics: Vec<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Subscribe {
            topics,
            respond_to: tx,
        };
        self.request(msg, rx).await
    }

    /// Waits up to `timeout` for the next message.
    pub async fn poll(&self, timeout: Duration) -> Result<Option<KafkaMessage>> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Poll {
            timeout,
            respond_to: tx,
        };
        self.request(msg, rx).await
    }

    /// Commits the position after `offset`. Commits are asynchronous on the broker side.
    pub async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Commit {
            topic: topic.to_string(),
            partition,
            offset,
            respond_to: tx,
        };
        self.request(msg, rx).await
    }

    /// Unsubscribes and stops the actor, later calls fail.
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(KafkaActorMessage::Close { respond_to: tx }, rx)
            .await
    }
}
