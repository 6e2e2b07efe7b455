//! Pipeline counters exposed in the Prometheus text format.

use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::{debug, error};

// Every metric is registered under this prefix.
const REGISTRY_PREFIX: &str = "influxbridge";

// counters, the `_total` suffix is added by the client library
const READ_TOTAL: &str = "read";
const PARSE_ERROR_TOTAL: &str = "parse_error";
const ENQUEUED_TOTAL: &str = "enqueued";
const DROPPED_TOTAL: &str = "dropped";
const COMMIT_ERROR_TOTAL: &str = "commit_error";
const WRITE_TOTAL: &str = "write";
const WRITE_ERROR_TOTAL: &str = "write_error";
const SKIPPED_TOTAL: &str = "skipped";
const DEAD_LETTER_TOTAL: &str = "dead_letter";

const QUEUE_SIZE: &str = "queue_size";

#[derive(Default)]
struct GlobalRegistry {
    // metrics are registered only once, so a blocking mutex is fine
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(REGISTRY_PREFIX)),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Counters updated by the consumer, the batch queue and the writer.
pub(crate) struct PipelineMetrics {
    pub(crate) read: Counter,
    pub(crate) parse_errors: Counter,
    pub(crate) enqueued: Counter,
    /// Records dropped because the queue was full.
    pub(crate) dropped: Counter,
    pub(crate) commit_errors: Counter,
    /// Records accepted by the sink.
    pub(crate) written: Counter,
    pub(crate) write_errors: Counter,
    /// Records of batches skipped while the circuit was open.
    pub(crate) skipped: Counter,
    pub(crate) dead_lettered: Counter,
    pub(crate) queue_size: Gauge,
}

impl PipelineMetrics {
    fn new() -> Self {
        let metrics = Self {
            read: Counter::default(),
            parse_errors: Counter::default(),
            enqueued: Counter::default(),
            dropped: Counter::default(),
            commit_errors: Counter::default(),
            written: Counter::default(),
            write_errors: Counter::default(),
            skipped: Counter::default(),
            dead_lettered: Counter::default(),
            queue_size: Gauge::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            READ_TOTAL,
            "Total number of messages read from the source",
            metrics.read.clone(),
        );
        registry.register(
            PARSE_ERROR_TOTAL,
            "Total number of messages that could not be parsed",
            metrics.parse_errors.clone(),
        );
        registry.register(
            ENQUEUED_TOTAL,
            "Total number of records accepted by the batch queue",
            metrics.enqueued.clone(),
        );
        registry.register(
            DROPPED_TOTAL,
            "Total number of records dropped because the batch queue was full",
            metrics.dropped.clone(),
        );
        registry.register(
            COMMIT_ERROR_TOTAL,
            "Total number of failed offset commits",
            metrics.commit_errors.clone(),
        );
        registry.register(
            WRITE_TOTAL,
            "Total number of records written to the sink",
            metrics.written.clone(),
        );
        registry.register(
            WRITE_ERROR_TOTAL,
            "Total number of failed sink write attempts",
            metrics.write_errors.clone(),
        );
        registry.register(
            SKIPPED_TOTAL,
            "Total number of records skipped while the circuit breaker was open",
            metrics.skipped.clone(),
        );
        registry.register(
            DEAD_LETTER_TOTAL,
            "Total number of records appended to the dead-letter log",
            metrics.dead_lettered.clone(),
        );
        registry.register(
            QUEUE_SIZE,
            "Number of records waiting in the batch queue",
            metrics.queue_size.clone(),
        );
        metrics
    }
}

static PIPELINE_METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

pub(crate) fn pipeline_metrics() -> &'static PipelineMetrics {
    PIPELINE_METRICS.get_or_init(PipelineMetrics::new)
}

/// Encodes every registered metric.
pub(crate) async fn metrics_handler() -> impl IntoResponse {
    // make sure the pipeline metrics are registered even before the first message
    pipeline_metrics();

    let mut buffer = String::new();
    let encoded = {
        let registry = global_registry().registry.lock();
        encode(&mut buffer, &registry)
    };
    if let Err(e) = encoded {
        error!(?e, "Encoding metrics failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    debug!("Exposing metrics: {:?}", buffer);
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}
