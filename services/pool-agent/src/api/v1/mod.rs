//! API v1 routes.

mod scenes;
mod viewports;

use axum::Router;

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/viewports", viewports::routes())
        .nest("/scenes", scenes::routes())
}
