//! Streams records from Kafka into InfluxDB.
//!
//! The [`consumer`] polls messages with bounded concurrency, parses them and puts them on
//! the [`batcher`] queue, committing each offset once its record is queued. The queue is
//! flushed in batches by size and by timer through the [`writer`], which retries, trips a
//! circuit breaker when the sink keeps failing and spools what it could not write to a
//! dead-letter log.

use influxbridge_influxdb::{InfluxClient, InfluxConfig};
use influxbridge_kafka::{KafkaAuth, KafkaConfig, KafkaConsumer};
use tokio::signal;
use tracing::{info, warn};

pub use self::error::{Error, Result};

mod error;

pub mod batcher;
pub mod breaker;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod parse;
pub mod pipeline;
pub mod provision;
pub mod record;
pub mod sink;
pub mod source;
pub mod writer;

mod health;
mod metrics;

use crate::config::Settings;
use crate::pipeline::Pipeline;

/// Runs the pipeline configured through the environment until SIGINT or SIGTERM.
pub async fn run() -> Result<()> {
    let settings = Settings::load()?;
    info!(?settings, "Starting influxbridge");

    let consumer = KafkaConsumer::connect(KafkaConfig {
        brokers: settings.kafka.brokers.clone(),
        consumer_group: settings.kafka.group_id.clone(),
        security_protocol: settings.kafka.security_protocol.clone(),
        auth: settings.kafka.sasl.as_ref().map(|sasl| KafkaAuth::Sasl {
            mechanism: sasl.mechanism.clone(),
            username: sasl.username.clone(),
            password: sasl.password.clone(),
        }),
    })?;
    let client = InfluxClient::new(InfluxConfig {
        url: settings.influx.url.clone(),
        token: settings.influx.token.clone(),
        org: settings.influx.org.clone(),
        bucket: settings.influx.bucket.clone(),
        timeout: settings.influx.timeout,
    })
    .map_err(|e| Error::Config(format!("Creating InfluxDB client: {e}")))?;

    let parser = settings.parser;
    let handle = Pipeline::start(settings, consumer, parser, client.clone(), client).await?;

    tokio::select! {
        _ = shutdown_signal() => info!("Shutting down"),
        _ = handle.stopping() => warn!("Pipeline stopped on its own, shutting down"),
    }
    handle.stop().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                warn!(?e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
