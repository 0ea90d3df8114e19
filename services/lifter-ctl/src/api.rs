//! Metrics and health endpoints.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use lifter_reconcile::{Metrics, PoolHandle, ShadowStore};

use crate::exporter::MetricsExporter;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    pub metrics: Arc<Metrics>,
    pub shadow: Arc<ShadowStore>,
    pub pool: PoolHandle,
    pub exporter: Arc<MetricsExporter>,
    pub table_capacity: usize,
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    /// Service keys tracked in the shadow store.
    pub shadow_entries: usize,

    /// Keys whose table entries do not yet match desired state.
    pub pending_keys: usize,

    /// Keys in the middle of a convergence pass.
    pub in_flight_keys: usize,

    /// Items waiting in worker mailboxes.
    pub queued: usize,

    pub table_capacity: usize,

    /// Failed table attempts since start.
    pub apply_failures: u64,
}

/// Create the router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    let shadow = state.shadow.status().await;
    let queued = state.pool.queued();

    // Pending keys with nothing queued are waiting on a retry timer.
    let status = if shadow.pending > 0 && queued == 0 {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status: status.to_string(),
        service: "lifter-ctl".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        shadow_entries: shadow.entries,
        pending_keys: shadow.pending,
        in_flight_keys: shadow.in_flight,
        queued,
        table_capacity: state.table_capacity,
        apply_failures: snapshot.failures_total(),
    })
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.exporter.render(&state.metrics.snapshot()),
    )
}

/// Serve on an already bound listener until shutdown is signaled.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "serving metrics and health");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("HTTP server shutting down");
        })
        .await
}
