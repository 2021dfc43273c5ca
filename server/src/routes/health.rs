//! Unauthenticated health-check endpoint.

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::state::GatewayState;

/// `GET /api/health`: liveness probe.
///
/// Returns status, uptime, version and relay counters. No authentication
/// required, suitable for load-balancer health checks. Answers 503 when the
/// hub no longer responds.
pub async fn health(State(state): State<GatewayState>) -> (StatusCode, Json<Value>) {
    let uptime = state.start_time.elapsed().as_secs();
    let Some(snapshot) = state.hub.snapshot().await else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unavailable",
                "uptime_secs": uptime,
                "version": env!("CARGO_PKG_VERSION"),
            })),
        );
    };

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "uptime_secs": uptime,
            "version": env!("CARGO_PKG_VERSION"),
            "backends": snapshot.backends,
            "clients": snapshot.clients,
            "connections": snapshot.connections,
            "pending_requests": snapshot.pending_requests,
        })),
    )
}
