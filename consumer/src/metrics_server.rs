//! HTTP server for the Prometheus metrics endpoint
//!
//! Serves `/metrics` for scraping and `/health`, which reports whether the
//! broker session is up.
//!
//! # Example
//!
//! ```ignore
//! let handle = MetricsServer::start(addr, metrics, health, shutdown.clone());
//! shutdown.cancel();
//! handle.await?;
//! ```

use crate::broker::ConnectionHealth;
use crate::metrics::Metrics;
use axum::extract::State;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    metrics: Arc<Metrics>,
    health: ConnectionHealth,
}

/// Metrics HTTP server
pub struct MetricsServer;

impl MetricsServer {
    /// Start the metrics server on `addr`
    ///
    /// The server stops when `shutdown` is cancelled.
    pub fn start(
        addr: SocketAddr,
        metrics: Arc<Metrics>,
        health: ConnectionHealth,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, %addr, "Failed to bind metrics server");
                    return;
                }
            };

            info!(%addr, "Metrics server listening");

            let app = router(AppState { metrics, health });
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!(error = %e, "Metrics server error");
            }
        })
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.gather(),
    )
}

/// Handler for /health endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.health.is_connected() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DISCONNECTED")
    }
}
