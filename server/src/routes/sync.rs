//! Sync endpoint routes.

use axum::{extract::State, routing::post, Json, Router};
use cairn_engine::{PushRequest, PushResponse};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::handle_push;
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/sync", post(push_handler))
}

/// POST /sync - Push records to the server.
async fn push_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    let response = handle_push(&state.repo, request, state.config.max_batch_size)?;
    Ok(Json(response))
}
