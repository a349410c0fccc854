//! Axum HTTP server for metrics and health probes

use std::net::SocketAddr;

use axum::{http::StatusCode, routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::controller::metrics;
use crate::{Error, Result};

/// Metrics endpoint handler
async fn metrics_handler() -> (StatusCode, String) {
    match metrics::encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

pub fn router() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
}

/// Serve `/metrics` and `/healthz` until the process exits
pub async fn run_server(addr: SocketAddr) -> Result<()> {
    info!("Metrics server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, router())
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;
    Ok(())
}
