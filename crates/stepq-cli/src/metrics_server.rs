use axum::{extract::State, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use stepq_broker::PriorityBroker;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

async fn metrics_handler(State(broker): State<Arc<PriorityBroker>>) -> String {
    // Refresh the depth gauges on every scrape.
    if let Err(e) = broker.queue_depths().await {
        warn!(kind = %e.kind(), error = %e, "could not refresh queue depths");
    }
    broker.metrics().gather_text()
}

pub fn router(broker: Arc<PriorityBroker>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(broker)
}

/// Serve `/metrics` until `shutdown` is cancelled.
pub async fn serve(
    broker: Arc<PriorityBroker>,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");

    axum::serve(listener, router(broker))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
