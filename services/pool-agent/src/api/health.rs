//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    /// Viewports served, present on readiness checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewports: Option<Vec<String>>,
}

impl HealthResponse {
    fn ok(viewports: Option<Vec<String>>) -> Self {
        Self {
            status: "ok".to_string(),
            service: "pool-agent".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
            viewports,
        }
    }
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

/// Basic health check - is the service running?
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse::ok(None))
}

/// Readiness check - the pools exist from startup, so this lists them.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let viewports = state.registry().viewports().map(str::to_string).collect();
    Json(HealthResponse::ok(Some(viewports)))
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
