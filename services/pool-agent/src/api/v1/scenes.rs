//! Director scene endpoint.

use axum::{extract::State, response::IntoResponse, routing::post, Json, Router};

use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", post(apply_scene))
}

async fn apply_scene(
    State(state): State<AppState>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let scene = state.decoder().decode(&body).map_err(|e| {
        tracing::warn!(error = %e, "Rejected scene");
        ApiError::from(e)
    })?;

    Ok(Json(state.registry().apply_scene(&scene).await))
}
