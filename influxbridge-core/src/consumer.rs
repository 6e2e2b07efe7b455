//! Polls the source and processes up to `max_parallelism` messages at once.
//!
//! Every message is parsed, enqueued and only then committed, so a record is never
//! acknowledged before it is in the batch queue. Polling stops while all permits are taken.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::{BatchQueue, Enqueue};
use crate::config::Settings;
use crate::error::Result;
use crate::metrics::pipeline_metrics;
use crate::parse::Parser;
use crate::sink::Sink;
use crate::source::{MessageSource, RawMessage, SourceOffset};

pub struct Consumer<M, P, S> {
    source: M,
    parser: Arc<P>,
    queue: BatchQueue<S>,
    topics: Vec<String>,
    max_parallelism: u32,
    poll_timeout: Duration,
    poll_error_delay: Duration,
    shutdown_grace: Duration,
    commit_on_parse_failure: bool,
}

impl<M, P, S> Consumer<M, P, S>
where
    M: MessageSource + Clone + Sync + 'static,
    P: Parser,
    S: Sink + Sync + 'static,
{
    pub fn new(source: M, parser: P, queue: BatchQueue<S>, settings: &Settings) -> Self {
        Self {
            source,
            parser: Arc::new(parser),
            queue,
            topics: settings.kafka.topics.clone(),
            max_parallelism: u32::try_from(settings.max_parallelism.max(1)).unwrap_or(u32::MAX),
            poll_timeout: settings.poll_timeout,
            poll_error_delay: settings.poll_error_delay,
            shutdown_grace: settings.shutdown_grace,
            commit_on_parse_failure: settings.commit_on_parse_failure,
        }
    }

    /// Runs until `cancel` fires, then waits for in-flight messages, drains the queue and
    /// closes the source.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        self.source.subscribe(&self.topics).await?;
        info!(topics = ?self.topics, "Subscribed, consuming");

        let semaphore = Arc::new(Semaphore::new(self.max_parallelism as usize));
        let mut tasks = JoinSet::new();

        loop {
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!(?e, "Message task failed");
                }
            }

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self.source.poll(self.poll_timeout) => polled,
            };
            let message = match polled {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    warn!(?e, "Polling failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_error_delay) => continue,
                    }
                }
            };
            pipeline_metrics().read.inc();

            // blocks polling while all permits are taken
            let permit: OwnedSemaphorePermit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(offset = %message.offset, "Shutting down, leaving message uncommitted");
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let task = MessageTask {
                source: self.source.clone(),
                parser: Arc::clone(&self.parser),
                queue: self.queue.clone(),
                commit_on_parse_failure: self.commit_on_parse_failure,
            };
            tasks.spawn(async move {
                let _permit = permit;
                task.process(message).await;
            });
        }

        self.shutdown(semaphore, tasks).await
    }

    async fn shutdown(&self, semaphore: Arc<Semaphore>, mut tasks: JoinSet<()>) -> Result<()> {
        info!(
            in_flight = tasks.len(),
            grace = ?self.shutdown_grace,
            "Stopping consumer"
        );
        match timeout(
            self.shutdown_grace,
            semaphore.acquire_many(self.max_parallelism),
        )
        .await
        {
            Ok(_) => info!("In-flight messages finished"),
            Err(_) => {
                warn!(
                    in_flight = tasks.len(),
                    "Shutdown grace elapsed, abandoning in-flight messages"
                );
                tasks.abort_all();
            }
        }
        while let Some(result) = tasks.join_next().await {
            match result {
                Err(e) if e.is_panic() => error!(?e, "Message task panicked"),
                _ => {}
            }
        }

        match timeout(self.shutdown_grace, self.queue.drain()).await {
            Ok(drained) => info!(drained, "Batch queue drained"),
            Err(_) => warn!(
                remaining = self.queue.len(),
                "Final drain timed out, remaining records are lost"
            ),
        }

        self.source.close().await?;
        info!("Consumer stopped");
        Ok(())
    }
}

/// Processing of a single message, run on its own task.
struct MessageTask<M, P, S> {
    source: M,
    parser: Arc<P>,
    queue: BatchQueue<S>,
    commit_on_parse_failure: bool,
}

impl<M, P, S> MessageTask<M, P, S>
where
    M: MessageSource,
    P: Parser,
    S: Sink + Sync + 'static,
{
    async fn process(&self, message: RawMessage) {
        let RawMessage { payload, offset } = message;
        match self.parser.parse(&payload) {
            Ok(record) => {
                if self.queue.enqueue(record) == Enqueue::Dropped {
                    debug!(%offset, "Record dropped by the full queue, committing anyway");
                }
                self.commit(&offset).await;
            }
            Err(e) => {
                pipeline_metrics().parse_errors.inc();
                warn!(%offset, ?e, "Dropping message that could not be parsed");
                if self.commit_on_parse_failure {
                    self.commit(&offset).await;
                }
            }
        }
    }

    async fn commit(&self, offset: &SourceOffset) {
        if let Err(e) = self.source.commit(offset).await {
            pipeline_metrics().commit_errors.inc();
            warn!(%offset, ?e, "Committing offset failed");
        }
    }
}
