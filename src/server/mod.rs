//! HTTP surface of the scanner.
//!
//! Thin JSON layer over [`ScannerService`]: batch endpoints for scan and
//! bulk fetch, a JSON metrics snapshot, Prometheus text exposition, and a
//! liveness probe.

use crate::scanner::{BulkFetchRequest, ScanError, ScanRequest, ScannerService};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

impl IntoResponse for ScanError {
    fn into_response(self) -> Response {
        let status = match &self {
            ScanError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ScanError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Assemble the API router around a shared service handle.
pub fn router(service: Arc<ScannerService>) -> Router {
    Router::new()
        .route("/api/scan", post(api_scan))
        .route("/api/fetch", post(api_fetch))
        .route("/api/metrics", get(api_metrics))
        .route("/metrics", get(api_prometheus))
        .route("/health", get(health))
        .with_state(service)
}

/// Bind the configured address and serve until SIGINT or SIGTERM.
pub async fn serve(service: Arc<ScannerService>) -> Result<()> {
    let bind_address = service.config().server.bind_address.clone();
    let app = router(service);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("bind {bind_address}"))?;
    info!(%bind_address, "Scanner listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn api_scan(
    State(service): State<Arc<ScannerService>>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<crate::scanner::ScanResponse>, ScanError> {
    service.scan(request).await.map(Json)
}

async fn api_fetch(
    State(service): State<Arc<ScannerService>>,
    Json(request): Json<BulkFetchRequest>,
) -> Result<Json<crate::scanner::BulkFetchResponse>, ScanError> {
    service.bulk_fetch(request).await.map(Json)
}

async fn api_metrics(State(service): State<Arc<ScannerService>>) -> Response {
    Json(service.get_metrics()).into_response()
}

async fn api_prometheus(State(service): State<Arc<ScannerService>>) -> Response {
    match service.encode_prometheus() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}
