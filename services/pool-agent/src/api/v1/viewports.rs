//! Per-viewport pool endpoints.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::model::DesiredSnapshot;
use crate::pool::PoolReconciler;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_viewports))
        .route("/{viewport}", get(describe_viewport))
        .route("/{viewport}/snapshot", put(apply_snapshot))
        .route("/{viewport}/relaunch", post(relaunch_viewport))
}

#[derive(Debug, Serialize)]
struct ViewportSummary {
    viewport: String,
    instances: usize,
}

#[derive(Debug, Serialize)]
struct ViewportsResponse {
    items: Vec<ViewportSummary>,
}

fn pool(state: &AppState, viewport: &str) -> Result<Arc<PoolReconciler>, ApiError> {
    state
        .registry()
        .get(viewport)
        .ok_or_else(|| ApiError::unknown_viewport(viewport))
}

async fn list_viewports(State(state): State<AppState>) -> impl IntoResponse {
    let mut items = Vec::new();
    for pool in state.registry().pools() {
        items.push(ViewportSummary {
            viewport: pool.viewport().to_string(),
            instances: pool.instance_count().await,
        });
    }
    Json(ViewportsResponse { items })
}

async fn describe_viewport(
    State(state): State<AppState>,
    Path(viewport): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = pool(&state, &viewport)?;
    Ok(Json(pool.describe_state().await))
}

async fn apply_snapshot(
    State(state): State<AppState>,
    Path(viewport): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let pool = pool(&state, &viewport)?;

    // Decoded before the pool is touched: a bad body never mutates state.
    let snapshot: DesiredSnapshot = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!(viewport = %viewport, error = %e, "Rejected snapshot");
        ApiError::bad_request("invalid_snapshot", e.to_string()).with_viewport(viewport.as_str())
    })?;

    Ok(Json(pool.reconcile(&snapshot).await))
}

async fn relaunch_viewport(
    State(state): State<AppState>,
    Path(viewport): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = pool(&state, &viewport)?;
    Ok(Json(pool.relaunch().await))
}
