//! HTTP API: a thin layer over the orchestrator.

pub mod error;
pub mod routes;

use crate::core::orchestrator::Orchestrator;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the router with all routes and middleware.
pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/generate", post(routes::generate))
        .route("/apply", post(routes::apply))
        .route("/audit", get(routes::audit))
        .route("/runs/{id}", get(routes::get_run))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(orchestrator: Arc<Orchestrator>, addr: &str) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("cannot bind {}: {}", addr, e))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, build_router(orchestrator))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .map_err(|e| format!("server error: {}", e))
}
