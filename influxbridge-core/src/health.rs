//! Liveness, readiness and metrics endpoints.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Error;
use crate::error::Result;
use crate::metrics::metrics_handler;
use crate::sink::Sink;
use crate::source::MessageSource;

#[derive(Clone)]
struct HealthState<S, M> {
    sink: S,
    source: M,
    readiness_timeout: Duration,
}

pub(crate) fn router<S, M>(sink: S, source: M, readiness_timeout: Duration) -> Router
where
    S: Sink + Clone + Sync + 'static,
    M: MessageSource + Clone + Sync + 'static,
{
    Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz::<S, M>))
        .route("/metrics", get(metrics_handler))
        .with_state(HealthState {
            sink,
            source,
            readiness_timeout,
        })
}

/// Binds `port` on all interfaces and serves until `cancel` fires.
pub(crate) async fn start_health_server<S, M>(
    port: u16,
    sink: S,
    source: M,
    readiness_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)>
where
    S: Sink + Clone + Sync + 'static,
    M: MessageSource + Clone + Sync + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::Health(format!("Binding port {port}: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| Error::Health(format!("Reading local address: {e}")))?;
    info!(%addr, "Health server listening");

    let app = router(sink, source, readiness_timeout);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            error!(?e, "Health server failed");
        }
        info!("Health server stopped");
    });
    Ok((addr, handle))
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Ready while both the sink and the brokers answer in time.
async fn readyz<S: Sink, M: MessageSource>(
    State(state): State<HealthState<S, M>>,
) -> impl IntoResponse {
    let timeout = state.readiness_timeout;
    let (sink, source) = tokio::join!(
        sink_ready(&state.sink, timeout),
        source_ready(&state.source, timeout)
    );
    if sink && source {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn sink_ready<S: Sink>(sink: &S, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, sink.ping()).await {
        Ok(Ok(true)) => true,
        Ok(Ok(false)) => {
            warn!("Sink reports unhealthy");
            false
        }
        Ok(Err(e)) => {
            warn!(?e, "Sink ping failed");
            false
        }
        Err(_) => {
            warn!(?timeout, "Sink ping timed out");
            false
        }
    }
}

async fn source_ready<M: MessageSource>(source: &M, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, source.ping(timeout)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(?e, "Broker ping failed");
            false
        }
        Err(_) => {
            warn!(?timeout, "Broker ping timed out");
            false
        }
    }
}
