use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{error, info};

use crate::Error;
use crate::batcher::BatchQueue;
use crate::config::Settings;
use crate::consumer::Consumer;
use crate::dead_letter::DeadLetterLog;
use crate::error::Result;
use crate::health::start_health_server;
use crate::parse::Parser;
use crate::provision::{Provisioned, provision};
use crate::sink::{Provisioning, Sink};
use crate::source::MessageSource;
use crate::writer::ResilientWriter;

/// Wires a message source to a sink.
pub struct Pipeline;

impl Pipeline {
    /// Provisions the sink, then starts the flush timer, the health server and the
    /// consumer. A provisioning failure aborts the start.
    pub async fn start<M, P, S, V>(
        settings: Settings,
        source: M,
        parser: P,
        sink: S,
        provisioning: V,
    ) -> Result<PipelineHandle>
    where
        M: MessageSource + Clone + Sync + 'static,
        P: Parser,
        S: Sink + Clone + Sync + 'static,
        V: Provisioning,
    {
        let provisioned = provision(
            &provisioning,
            &settings.influx.org,
            &settings.influx.bucket,
            settings.influx.retention_seconds,
        )
        .await?;

        let cancel = CancellationToken::new();
        let writer = Arc::new(ResilientWriter::new(
            sink.clone(),
            settings.retry,
            settings.breaker,
            DeadLetterLog::new(&settings.dead_letter_path),
            cancel.clone(),
        ));
        let queue = BatchQueue::new(
            writer,
            settings.batch_size,
            settings.max_queue_size,
            settings.flush_interval,
        );
        let timer = queue.start(cancel.clone());

        let (health_addr, health) = match start_health_server(
            settings.server_port,
            sink,
            source.clone(),
            settings.readiness_timeout,
            cancel.clone(),
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };

        let consumer = Consumer::new(source, parser, queue, &settings);
        let consumer_cancel = cancel.clone();
        let consumer = tokio::spawn(async move {
            let result = consumer.run(consumer_cancel.clone()).await;
            if let Err(e) = &result {
                error!(?e, "Consumer stopped with an error");
            }
            // take the rest of the pipeline down with it
            consumer_cancel.cancel();
            result
        });

        info!(
            batch_size = settings.batch_size,
            max_queue_size = settings.max_queue_size,
            max_parallelism = settings.max_parallelism,
            "Pipeline started"
        );
        Ok(PipelineHandle {
            cancel,
            provisioned,
            health_addr,
            consumer,
            timer,
            health,
        })
    }
}

/// A running pipeline.
pub struct PipelineHandle {
    cancel: CancellationToken,
    provisioned: Provisioned,
    health_addr: SocketAddr,
    consumer: JoinHandle<Result<()>>,
    timer: JoinHandle<()>,
    health: JoinHandle<()>,
}

impl PipelineHandle {
    pub fn provisioned(&self) -> &Provisioned {
        &self.provisioned
    }

    pub fn health_addr(&self) -> SocketAddr {
        self.health_addr
    }

    /// Resolves once the pipeline is stopping, including when the consumer exits on its own.
    pub fn stopping(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Stops polling, waits for the consumer to drain the queue and for the background
    /// tasks to finish.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        let result = match self.consumer.await {
            Ok(result) => result,
            Err(e) => Err(Error::Source(format!("Consumer task failed: {e}"))),
        };
        if let Err(e) = self.timer.await {
            error!(?e, "Flush timer task failed");
        }
        if let Err(e) = self.health.await {
            error!(?e, "Health server task failed");
        }
        info!("Pipeline stopped");
        result
    }
}
