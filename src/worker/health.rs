//! Liveness endpoint.
//!
//! `GET /health` answers `200 ok`; every other request is a 404. Container
//! orchestration probes this to decide whether the process is alive.

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tracing::{error, info};

async fn health() -> &'static str {
    "ok"
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Router for the liveness surface.
pub fn router() -> Router {
    Router::new().route("/health", get(health)).fallback(not_found)
}

/// Bind and serve the liveness endpoint in the background.
pub fn spawn(port: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(port, error = %e, "liveness server bind failed");
                return;
            }
        };
        info!(port, "liveness server listening");
        if let Err(e) = axum::serve(listener, router()).await {
            error!(error = %e, "liveness server exited");
        }
    })
}
